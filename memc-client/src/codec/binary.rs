//! # Binary Protocol
//!
//! Fixed 24-byte header framing, big endian.
//!
//! ```text
//! 0      1        2         4        5          6              8          12       16    24
//! +------+--------+---------+--------+----------+--------------+----------+--------+-----+
//! |magic |opcode  |key len  |extras  |data type |vbucket/status|body len  |opaque  |cas  |
//! +------+--------+---------+--------+----------+--------------+----------+--------+-----+
//! body := extras | key | value
//! ```
//!
//! Quiet opcodes suppress the reply on success; the connection appends a
//! NOOP when it needs to know every earlier quiet request has been handled.

use std::io::{self, BufRead};

use bytes::{BufMut, Bytes, BytesMut};
use memc_common::{Item, MemcError, MemcResult};

use super::{Frame, Reply, Request, StoreMode, MAX_ITEM_SIZE};
use crate::error::WireError;

pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;
pub const HEADER_SIZE: usize = 24;

/// Opcodes this client issues.
pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const FLUSH: u8 = 0x08;
    pub const NOOP: u8 = 0x0a;
    pub const SETQ: u8 = 0x11;
    pub const ADDQ: u8 = 0x12;
    pub const REPLACEQ: u8 = 0x13;
    pub const DELETEQ: u8 = 0x14;
    pub const FLUSHQ: u8 = 0x18;
}

/// Response status values.
pub mod status {
    pub const NO_ERROR: u16 = 0x0000;
    pub const KEY_NOT_FOUND: u16 = 0x0001;
    pub const KEY_EXISTS: u16 = 0x0002;
    pub const VALUE_TOO_LARGE: u16 = 0x0003;
    pub const INVALID_ARGUMENTS: u16 = 0x0004;
    pub const ITEM_NOT_STORED: u16 = 0x0005;
    pub const UNKNOWN_COMMAND: u16 = 0x0081;
    pub const OUT_OF_MEMORY: u16 = 0x0082;
}

/// Appends one binary request to `out`.
///
/// # Errors
/// - `InvalidArguments` for a delete with a TTL (no binary form) or a body
///   larger than the 32-bit length field.
pub fn encode(
    request: &Request<'_>,
    quiet: bool,
    opaque: u32,
    out: &mut BytesMut,
) -> MemcResult<()> {
    match *request {
        Request::Store {
            mode,
            key,
            value,
            flags,
            ttl,
        } => {
            let (op, cas) = match mode {
                StoreMode::Set => (if quiet { opcode::SETQ } else { opcode::SET }, 0),
                StoreMode::Cas(token) => (if quiet { opcode::SETQ } else { opcode::SET }, token),
                StoreMode::Add => (if quiet { opcode::ADDQ } else { opcode::ADD }, 0),
                StoreMode::Replace => (if quiet { opcode::REPLACEQ } else { opcode::REPLACE }, 0),
            };
            let header = Header {
                opcode: op,
                key_len: key.len(),
                extras_len: 8,
                value_len: value.len(),
                opaque,
                cas,
            };
            header.put(out)?;
            out.put_u32(flags);
            out.put_u32(ttl.as_secs());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(value);
        }
        Request::Get { key, .. } => {
            Header::simple(opcode::GET, key.len(), 0, opaque).put(out)?;
            out.extend_from_slice(key.as_bytes());
        }
        Request::Delete { key, ttl } => {
            if !ttl.is_never() {
                return Err(MemcError::InvalidArguments(
                    "binary protocol has no delayed delete".to_string(),
                ));
            }
            let op = if quiet { opcode::DELETEQ } else { opcode::DELETE };
            Header::simple(op, key.len(), 0, opaque).put(out)?;
            out.extend_from_slice(key.as_bytes());
        }
        Request::Flush { ttl } => {
            let op = if quiet { opcode::FLUSHQ } else { opcode::FLUSH };
            Header::simple(op, 0, 4, opaque).put(out)?;
            out.put_u32(ttl.as_secs());
        }
        Request::Noop => Header::simple(opcode::NOOP, 0, 0, opaque).put(out)?,
    }
    Ok(())
}

struct Header {
    opcode: u8,
    key_len: usize,
    extras_len: u8,
    value_len: usize,
    opaque: u32,
    cas: u64,
}

impl Header {
    fn simple(opcode: u8, key_len: usize, extras_len: u8, opaque: u32) -> Self {
        Header {
            opcode,
            key_len,
            extras_len,
            value_len: 0,
            opaque,
            cas: 0,
        }
    }

    fn put(&self, out: &mut BytesMut) -> MemcResult<()> {
        let body = usize::from(self.extras_len) + self.key_len + self.value_len;
        let body = u32::try_from(body).map_err(|_| {
            MemcError::InvalidArguments(format!("request body of {body} bytes is too large"))
        })?;
        let key_len = u16::try_from(self.key_len).map_err(|_| {
            MemcError::InvalidArguments("key too long for binary header".to_string())
        })?;

        out.reserve(HEADER_SIZE + body as usize);
        out.put_u8(REQUEST_MAGIC);
        out.put_u8(self.opcode);
        out.put_u16(key_len);
        out.put_u8(self.extras_len);
        out.put_u8(0); // data type
        out.put_u16(0); // vbucket
        out.put_u32(body);
        out.put_u32(self.opaque);
        out.put_u64(self.cas);
        Ok(())
    }
}

/// Reads one response packet and maps it onto a `Reply`.
pub fn read_reply<R: BufRead>(reader: &mut R, body: &mut Vec<u8>) -> Result<Frame, WireError> {
    let available = reader.fill_buf().map_err(WireError::Read)?;
    if available.is_empty() {
        return Err(WireError::Read(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before reply",
        )));
    }

    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).map_err(mid_reply)?;
    if header[0] != RESPONSE_MAGIC {
        return Err(MemcError::Protocol(format!("bad response magic 0x{:02x}", header[0])).into());
    }
    let op = header[1];
    let key_len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    let extras_len = usize::from(header[4]);
    let status_code = u16::from_be_bytes([header[6], header[7]]);
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let cas = u64::from_be_bytes([
        header[16], header[17], header[18], header[19], header[20], header[21], header[22],
        header[23],
    ]);
    if extras_len + key_len > body_len {
        return Err(MemcError::Protocol("header lengths exceed body length".to_string()).into());
    }
    if body_len - extras_len - key_len > MAX_ITEM_SIZE {
        return Err(MemcError::Protocol(format!(
            "body of {body_len} bytes exceeds the {MAX_ITEM_SIZE} byte item limit"
        ))
        .into());
    }

    body.clear();
    body.resize(body_len, 0);
    reader.read_exact(body).map_err(mid_reply)?;

    let reply = match status_code {
        status::NO_ERROR => match op {
            opcode::GET => {
                let flags = if extras_len >= 4 {
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]])
                } else {
                    0
                };
                Reply::Hit(Item {
                    value: Bytes::copy_from_slice(&body[extras_len + key_len..]),
                    flags,
                    cas: (cas != 0).then_some(cas),
                })
            }
            opcode::SET | opcode::ADD | opcode::REPLACE | opcode::SETQ | opcode::ADDQ
            | opcode::REPLACEQ => Reply::Stored,
            opcode::DELETE | opcode::DELETEQ => Reply::Deleted,
            opcode::NOOP => Reply::Noop,
            _ => Reply::Ok,
        },
        status::KEY_NOT_FOUND => match op {
            opcode::GET => Reply::Miss,
            opcode::REPLACE | opcode::REPLACEQ => Reply::NotStored,
            _ => Reply::NotFound,
        },
        status::KEY_EXISTS => match op {
            opcode::ADD | opcode::ADDQ => Reply::NotStored,
            _ => Reply::Exists,
        },
        status::VALUE_TOO_LARGE => Reply::ServerError(message(body, extras_len + key_len)),
        status::INVALID_ARGUMENTS => Reply::ClientError(message(body, extras_len + key_len)),
        status::ITEM_NOT_STORED => Reply::NotStored,
        status::UNKNOWN_COMMAND => Reply::Error,
        status::OUT_OF_MEMORY => Reply::OutOfMemory,
        other => Reply::ServerError(format!(
            "status 0x{other:04x}: {}",
            message(body, extras_len + key_len)
        )),
    };
    Ok(Frame { opaque, reply })
}

fn message(body: &[u8], skip: usize) -> String {
    String::from_utf8_lossy(body.get(skip..).unwrap_or_default())
        .trim()
        .to_string()
}

fn mid_reply(err: io::Error) -> WireError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        WireError::PartialRead
    } else {
        WireError::Read(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memc_common::{Key, Ttl};
    use std::io::Cursor;

    fn response(
        op: u8,
        status: u16,
        opaque: u32,
        cas: u64,
        extras: &[u8],
        value: &[u8],
    ) -> Vec<u8> {
        let mut out = vec![RESPONSE_MAGIC, op, 0, 0, extras.len() as u8, 0];
        out.extend_from_slice(&status.to_be_bytes());
        out.extend_from_slice(&((extras.len() + value.len()) as u32).to_be_bytes());
        out.extend_from_slice(&opaque.to_be_bytes());
        out.extend_from_slice(&cas.to_be_bytes());
        out.extend_from_slice(extras);
        out.extend_from_slice(value);
        out
    }

    fn read(bytes: Vec<u8>) -> Result<Frame, WireError> {
        let mut body = Vec::new();
        read_reply(&mut Cursor::new(bytes), &mut body)
    }

    #[test]
    fn encodes_set_header() {
        let key = Key::new("ab").unwrap();
        let mut out = BytesMut::new();
        let request = Request::Store {
            mode: StoreMode::Set,
            key: &key,
            value: b"xyz",
            flags: 1,
            ttl: Ttl(600),
        };
        encode(&request, false, 7, &mut out).unwrap();
        assert_eq!(out.len(), HEADER_SIZE + 8 + 2 + 3);
        assert_eq!(&out[..8], &[REQUEST_MAGIC, opcode::SET, 0, 2, 8, 0, 0, 0]);
        assert_eq!(&out[8..12], &13u32.to_be_bytes());
        assert_eq!(&out[12..16], &7u32.to_be_bytes());
        assert_eq!(&out[24..28], &1u32.to_be_bytes());
        assert_eq!(&out[28..32], &600u32.to_be_bytes());
        assert_eq!(&out[32..], b"abxyz");
    }

    #[test]
    fn quiet_and_cas_variants() {
        let key = Key::new("k").unwrap();
        let mut out = BytesMut::new();
        let request = Request::Store {
            mode: StoreMode::Cas(0xabcd),
            key: &key,
            value: b"v",
            flags: 0,
            ttl: Ttl::NEVER,
        };
        encode(&request, true, 0, &mut out).unwrap();
        assert_eq!(out[1], opcode::SETQ);
        assert_eq!(&out[16..24], &0xabcdu64.to_be_bytes());

        out.clear();
        encode(&Request::Flush { ttl: Ttl(3) }, false, 0, &mut out).unwrap();
        assert_eq!(out[1], opcode::FLUSH);
        assert_eq!(out[4], 4);
        assert_eq!(&out[24..], &3u32.to_be_bytes());
    }

    #[test]
    fn delete_with_ttl_is_rejected() {
        let key = Key::new("k").unwrap();
        let mut out = BytesMut::new();
        let request = Request::Delete { key: &key, ttl: Ttl(5) };
        let err = encode(&request, false, 0, &mut out).unwrap_err();
        assert!(matches!(err, MemcError::InvalidArguments(_)));
    }

    #[test]
    fn decodes_hit_with_flags_and_cas() {
        let frame = read(response(opcode::GET, 0, 9, 77, &5u32.to_be_bytes(), b"hello")).unwrap();
        assert_eq!(frame.opaque, 9);
        assert_eq!(
            frame.reply,
            Reply::Hit(Item {
                value: Bytes::from_static(b"hello"),
                flags: 5,
                cas: Some(77)
            })
        );
    }

    #[test]
    fn status_mapping_depends_on_opcode() {
        let cases = [
            (opcode::GET, status::KEY_NOT_FOUND, Reply::Miss),
            (opcode::DELETE, status::KEY_NOT_FOUND, Reply::NotFound),
            (opcode::REPLACE, status::KEY_NOT_FOUND, Reply::NotStored),
            (opcode::ADD, status::KEY_EXISTS, Reply::NotStored),
            (opcode::SET, status::KEY_EXISTS, Reply::Exists),
            (opcode::SET, status::NO_ERROR, Reply::Stored),
            (opcode::DELETE, status::NO_ERROR, Reply::Deleted),
            (opcode::FLUSH, status::NO_ERROR, Reply::Ok),
            (opcode::NOOP, status::NO_ERROR, Reply::Noop),
            (opcode::SET, status::ITEM_NOT_STORED, Reply::NotStored),
            (0x42, status::UNKNOWN_COMMAND, Reply::Error),
        ];
        for (op, status, expected) in cases {
            let frame = read(response(op, status, 0, 0, &[], &[])).unwrap();
            assert_eq!(frame.reply, expected, "op {op:#x} status {status:#x}");
        }
    }

    #[test]
    fn error_bodies_become_messages() {
        let too_large = response(opcode::SET, status::VALUE_TOO_LARGE, 0, 0, &[], b"Too large");
        let frame = read(too_large).unwrap();
        assert_eq!(frame.reply, Reply::ServerError("Too large".into()));
        let frame = read(response(opcode::SET, status::OUT_OF_MEMORY, 9, 0, &[], b"")).unwrap();
        assert_eq!(frame, Frame { opaque: 9, reply: Reply::OutOfMemory });
    }

    #[test]
    fn oversized_body_is_rejected_before_reading() {
        let mut header = response(opcode::GET, status::NO_ERROR, 0, 0, &[], b"");
        header[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(read(header), Err(WireError::Fatal(MemcError::Protocol(_)))));

        let mut header = response(opcode::GET, status::NO_ERROR, 0, 0, &[0, 0, 0, 0], b"");
        let body_len = (MAX_ITEM_SIZE + 5) as u32;
        header[8..12].copy_from_slice(&body_len.to_be_bytes());
        assert!(matches!(read(header), Err(WireError::Fatal(MemcError::Protocol(_)))));
    }

    #[test]
    fn framing_errors() {
        let mut bad_magic = response(opcode::GET, 0, 0, 0, &[], b"");
        bad_magic[0] = 0x42;
        assert!(matches!(read(bad_magic), Err(WireError::Fatal(MemcError::Protocol(_)))));

        let mut short = response(opcode::GET, 0, 0, 0, &[0, 0, 0, 0], b"value");
        short.truncate(short.len() - 2);
        assert!(matches!(read(short), Err(WireError::PartialRead)));

        assert!(matches!(read(vec![RESPONSE_MAGIC, 0, 0]), Err(WireError::PartialRead)));
        assert!(matches!(read(Vec::new()), Err(WireError::Read(_))));
    }
}

//! # Text Protocol
//!
//! Line-oriented memcached framing.
//!
//! ```text
//! set|add|replace <key> <flags> <ttl> <bytes> [noreply]\r\n<data>\r\n
//! cas <key> <flags> <ttl> <bytes> <token> [noreply]\r\n<data>\r\n
//! get|gets <key>\r\n
//! delete <key> [<ttl>] [noreply]\r\n
//! flush_all [<ttl>] [noreply]\r\n
//! ```

use std::io::{self, BufRead};

use bytes::{Bytes, BytesMut};
use memc_common::{Item, MemcError, MemcResult};

use super::{push_u64, Reply, Request, StoreMode, MAX_ITEM_SIZE};
use crate::error::WireError;

/// Appends one text request to `out`.
pub fn encode(request: &Request<'_>, quiet: bool, out: &mut BytesMut) -> MemcResult<()> {
    match *request {
        Request::Store {
            mode,
            key,
            value,
            flags,
            ttl,
        } => {
            let verb: &[u8] = match mode {
                StoreMode::Set => b"set ",
                StoreMode::Add => b"add ",
                StoreMode::Replace => b"replace ",
                StoreMode::Cas(_) => b"cas ",
            };
            out.reserve(verb.len() + key.len() + value.len() + 64);
            out.extend_from_slice(verb);
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b" ");
            push_u64(out, u64::from(flags));
            out.extend_from_slice(b" ");
            push_u64(out, u64::from(ttl.as_secs()));
            out.extend_from_slice(b" ");
            push_u64(out, value.len() as u64);
            if let StoreMode::Cas(token) = mode {
                out.extend_from_slice(b" ");
                push_u64(out, token);
            }
            push_noreply(out, quiet);
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        Request::Get { key, with_cas } => {
            let verb: &[u8] = if with_cas { b"gets " } else { b"get " };
            out.extend_from_slice(verb);
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Request::Delete { key, ttl } => {
            out.extend_from_slice(b"delete ");
            out.extend_from_slice(key.as_bytes());
            if !ttl.is_never() {
                out.extend_from_slice(b" ");
                push_u64(out, u64::from(ttl.as_secs()));
            }
            push_noreply(out, quiet);
            out.extend_from_slice(b"\r\n");
        }
        Request::Flush { ttl } => {
            out.extend_from_slice(b"flush_all");
            if !ttl.is_never() {
                out.extend_from_slice(b" ");
                push_u64(out, u64::from(ttl.as_secs()));
            }
            push_noreply(out, quiet);
            out.extend_from_slice(b"\r\n");
        }
        Request::Noop => {
            return Err(MemcError::InvalidArguments(
                "noop exists only in the binary protocol".to_string(),
            ))
        }
    }
    Ok(())
}

fn push_noreply(out: &mut BytesMut, quiet: bool) {
    if quiet {
        out.extend_from_slice(b" noreply");
    }
}

/// Reads one complete reply.
pub fn read_reply<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> Result<Reply, WireError> {
    read_line(reader, line, false)?;
    if line.starts_with(b"VALUE ") {
        return read_value(reader, line);
    }

    let reply = match line.as_slice() {
        b"STORED" => Reply::Stored,
        b"NOT_STORED" => Reply::NotStored,
        b"EXISTS" => Reply::Exists,
        b"NOT_FOUND" => Reply::NotFound,
        b"DELETED" => Reply::Deleted,
        b"OK" => Reply::Ok,
        b"END" => Reply::Miss,
        b"ERROR" => Reply::Error,
        l if l.starts_with(b"CLIENT_ERROR") => Reply::ClientError(message(&l[12..])),
        l if l.starts_with(b"SERVER_ERROR") => {
            let msg = message(&l[12..]);
            if msg.starts_with("out of memory") {
                Reply::OutOfMemory
            } else {
                Reply::ServerError(msg)
            }
        }
        other => {
            return Err(MemcError::Protocol(format!(
                "unexpected reply {:?}",
                String::from_utf8_lossy(other)
            ))
            .into())
        }
    };
    Ok(reply)
}

/// Parses `VALUE <key> <flags> <bytes> [<cas>]`, the data block and `END`.
fn read_value<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> Result<Reply, WireError> {
    let header = String::from_utf8_lossy(line).into_owned();
    let bad_header = || WireError::from(MemcError::Protocol(format!("malformed {header:?}")));

    let mut fields = line.split(|&b| b == b' ').skip(2);
    let flags = fields.next().and_then(parse_u64).ok_or_else(bad_header)?;
    let flags = u32::try_from(flags).map_err(|_| bad_header())?;
    let len = fields.next().and_then(parse_u64).ok_or_else(bad_header)?;
    let cas = match fields.next() {
        Some(token) => Some(parse_u64(token).ok_or_else(bad_header)?),
        None => None,
    };
    if fields.next().is_some() {
        return Err(bad_header());
    }
    let len = usize::try_from(len).map_err(|_| bad_header())?;
    if len > MAX_ITEM_SIZE {
        return Err(MemcError::Protocol(format!(
            "value of {len} bytes exceeds the {MAX_ITEM_SIZE} byte item limit"
        ))
        .into());
    }

    let mut data = vec![0u8; len + 2];
    reader.read_exact(&mut data).map_err(mid_reply)?;
    if !data.ends_with(b"\r\n") {
        return Err(MemcError::Protocol("value block not terminated by CRLF".to_string()).into());
    }
    data.truncate(len);

    read_line(reader, line, true)?;
    if line.as_slice() != b"END" {
        return Err(MemcError::Protocol(format!(
            "expected END after value, got {:?}",
            String::from_utf8_lossy(line)
        ))
        .into());
    }

    Ok(Reply::Hit(Item {
        value: Bytes::from(data),
        flags,
        cas,
    }))
}

/// Reads one CRLF-terminated line into `buf` without the terminator.
///
/// EOF before the first byte of a reply is a read failure; EOF anywhere
/// after that is a partial read.
fn read_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    started: bool,
) -> Result<(), WireError> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf).map_err(|err| {
        if started {
            mid_reply(err)
        } else {
            WireError::Read(err)
        }
    })?;
    if bytes == 0 {
        if started {
            return Err(WireError::PartialRead);
        }
        return Err(WireError::Read(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before reply",
        )));
    }
    if buf.last() != Some(&b'\n') {
        return Err(WireError::PartialRead);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(MemcError::Protocol("line not terminated by CRLF".to_string()).into());
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn mid_reply(err: io::Error) -> WireError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        WireError::PartialRead
    } else {
        WireError::Read(err)
    }
}

fn message(rest: &[u8]) -> String {
    String::from_utf8_lossy(rest).trim().to_string()
}

fn parse_u64(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(value)
}

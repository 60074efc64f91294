//! # Wire Codec
//!
//! Purpose: Encode one request and decode one reply for either memcached
//! wire protocol, hiding the framing differences from the connection layer.
//!
//! ## Design Principles
//! 1. **One Request Vocabulary**: Callers build a `Request` once; the codec
//!    picks text or binary framing from the configured `Protocol`.
//! 2. **Buffer Reuse**: Encoding appends to a caller-owned `BytesMut`, reading
//!    reuses a caller-owned line buffer.
//! 3. **Fail Fast**: Any reply outside the known grammar is a hard protocol
//!    error; the stream is no longer trusted after that.
//! 4. **Binary-Safe**: Values are raw bytes in both protocols.

pub mod binary;
pub mod text;

use std::io::{BufRead, Cursor};

use bytes::{BufMut, BytesMut};
use memc_common::{BehaviorConfig, Item, Key, MemcError, MemcResult, Outcome, ReturnCode, Ttl};

use crate::error::WireError;

/// Largest datagram the UDP transport will send.
pub const MAX_UDP_DATAGRAM: usize = 1400;

/// Size of the frame header prepended to every UDP datagram.
pub const UDP_HEADER_SIZE: usize = 8;

/// Largest value a reply may announce; memcached's default item size.
pub const MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Wire protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Text,
    Binary,
}

impl Protocol {
    /// Protocol selected by `BinaryProtocol`.
    pub fn from_behavior(behavior: &BehaviorConfig) -> Self {
        if behavior.binary_protocol {
            Protocol::Binary
        } else {
            Protocol::Text
        }
    }
}

/// Storage command variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    /// Store only if the item still carries this CAS token.
    Cas(u64),
}

/// One operation as it goes on the wire.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    Store {
        mode: StoreMode,
        key: &'a Key,
        value: &'a [u8],
        flags: u32,
        ttl: Ttl,
    },
    Get {
        key: &'a Key,
        with_cas: bool,
    },
    Delete {
        key: &'a Key,
        ttl: Ttl,
    },
    Flush {
        ttl: Ttl,
    },
    /// Binary-only round-trip marker used to drain quiet replies.
    Noop,
}

impl Request<'_> {
    /// Key carried by the request, if any.
    pub fn key(&self) -> Option<&Key> {
        match self {
            Request::Store { key, .. } | Request::Get { key, .. } | Request::Delete { key, .. } => {
                Some(key)
            }
            Request::Flush { .. } | Request::Noop => None,
        }
    }

    /// True for operations that mutate server state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Request::Store { .. } | Request::Delete { .. } | Request::Flush { .. }
        )
    }
}

/// Per-request framing options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    /// Ask the server not to reply (text `noreply`, binary quiet opcodes).
    pub quiet: bool,
    /// Binary opaque echoed back in the reply.
    pub opaque: u32,
    /// Apply the strict printable-ASCII key check before encoding.
    pub verify_key: bool,
}

/// Decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Ok,
    Hit(Item),
    Miss,
    /// Command not recognised by the server.
    Error,
    ClientError(String),
    ServerError(String),
    /// Server could not allocate memory for the item.
    OutOfMemory,
    Noop,
}

impl Reply {
    /// Outcome code for this reply.
    pub fn code(&self) -> ReturnCode {
        match self {
            Reply::Stored => ReturnCode::Stored,
            Reply::NotStored => ReturnCode::NotStored,
            Reply::Exists => ReturnCode::DataExists,
            Reply::NotFound | Reply::Miss => ReturnCode::NotFound,
            Reply::Deleted => ReturnCode::Deleted,
            Reply::Ok | Reply::Hit(_) | Reply::Noop => ReturnCode::Success,
            Reply::Error => ReturnCode::Error,
            Reply::ClientError(_) => ReturnCode::ClientError,
            Reply::ServerError(_) => ReturnCode::ServerError,
            Reply::OutOfMemory => ReturnCode::MemoryAllocationFailure,
        }
    }

    /// Converts the reply into the caller-facing outcome.
    pub fn into_outcome(self) -> Outcome {
        match self {
            Reply::Hit(item) => Outcome::hit(item),
            other => Outcome::new(other.code()),
        }
    }
}

/// Reply plus the binary opaque it answers (0 for text).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opaque: u32,
    pub reply: Reply,
}

/// Protocol-specific encoder/decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    protocol: Protocol,
}

impl WireCodec {
    pub fn new(protocol: Protocol) -> Self {
        WireCodec { protocol }
    }

    pub fn for_behavior(behavior: &BehaviorConfig) -> Self {
        WireCodec::new(Protocol::from_behavior(behavior))
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Appends the encoded request to `out`.
    ///
    /// # Errors
    /// - `BadKey` when `verify_key` is set and the key fails the strict check.
    /// - `InvalidArguments` for requests the protocol cannot express.
    pub fn encode(
        &self,
        request: &Request<'_>,
        opts: EncodeOptions,
        out: &mut BytesMut,
    ) -> MemcResult<()> {
        if opts.verify_key {
            if let Some(key) = request.key() {
                key.verify_strict()?;
            }
        }
        match self.protocol {
            Protocol::Text => text::encode(request, opts.quiet, out),
            Protocol::Binary => binary::encode(request, opts.quiet, opts.opaque, out),
        }
    }

    /// Reads exactly one reply from the stream.
    pub fn read_frame<R: BufRead>(
        &self,
        reader: &mut R,
        scratch: &mut Vec<u8>,
    ) -> Result<Frame, WireError> {
        match self.protocol {
            Protocol::Text => {
                text::read_reply(reader, scratch).map(|reply| Frame { opaque: 0, reply })
            }
            Protocol::Binary => binary::read_reply(reader, scratch),
        }
    }

    /// Decodes one complete reply held in memory.
    ///
    /// # Examples
    /// ```rust
    /// use memc_client::codec::{Protocol, Reply, WireCodec};
    ///
    /// let codec = WireCodec::new(Protocol::Text);
    /// assert_eq!(codec.decode(b"NOT_STORED\r\n").unwrap(), Reply::NotStored);
    /// assert!(codec.decode(b"BOGUS\r\n").is_err());
    /// ```
    pub fn decode(&self, bytes: &[u8]) -> Result<Reply, WireError> {
        let mut cursor = Cursor::new(bytes);
        let mut scratch = Vec::new();
        self.read_frame(&mut cursor, &mut scratch).map(|frame| frame.reply)
    }
}

/// Writes the 8-byte UDP frame header for a single-datagram request.
pub fn put_udp_header(request_id: u16, out: &mut BytesMut) {
    out.put_u16(request_id);
    out.put_u16(0); // sequence number
    out.put_u16(1); // datagrams in this message
    out.put_u16(0); // reserved
}

/// Checks that an encoded request fits in one datagram.
pub fn check_udp_size(payload_len: usize) -> MemcResult<()> {
    if payload_len + UDP_HEADER_SIZE > MAX_UDP_DATAGRAM {
        return Err(MemcError::InvalidArguments(format!(
            "request of {payload_len} bytes does not fit in a UDP datagram"
        )));
    }
    Ok(())
}

/// Appends the decimal digits of `value`.
fn push_u64(out: &mut BytesMut, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}

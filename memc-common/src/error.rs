//! # Result Codes and Errors
//!
//! Purpose: Define the outcome taxonomy shared by every client operation and
//! the hard error type for failures that have no sensible outcome value.
//!
//! ## Design Principles
//! 1. **Two Channels**: Soft outcomes travel as `ReturnCode` inside `Ok`, hard
//!    failures travel as `MemcError` inside `Err`.
//! 2. **Stable Numbering**: Codes keep fixed integer values so embedding hosts
//!    can expose them as named constants.
//! 3. **Fail Fast**: Configuration and protocol problems are never downgraded
//!    to outcome values.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for fallible client calls.
pub type MemcResult<T> = Result<T, MemcError>;

/// Outcome code of one client operation.
///
/// The numeric values are stable and double as the constants an embedding
/// host exposes to its callers.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnCode {
    Success = 0,
    Failure = 1,
    HostLookupFailure = 2,
    ConnectionFailure = 3,
    WriteFailure = 5,
    ReadFailure = 6,
    ProtocolError = 8,
    ClientError = 9,
    ServerError = 10,
    Error = 11,
    DataExists = 12,
    DataDoesNotExist = 13,
    NotStored = 14,
    Stored = 15,
    NotFound = 16,
    MemoryAllocationFailure = 17,
    PartialRead = 18,
    SomeErrors = 19,
    NoServers = 20,
    End = 21,
    Deleted = 22,
    NotSupported = 28,
    Timeout = 31,
    Buffered = 32,
    BadKeyProvided = 33,
    ServerMarkedDead = 35,
    InvalidArguments = 38,
    KeyTooBig = 39,
    AuthProblem = 40,
    AuthFailure = 41,
    DuplicateServer = 50,
    ClientClosed = 51,
}

impl ReturnCode {
    /// Every code, in numeric order.
    pub const ALL: [ReturnCode; 32] = [
        ReturnCode::Success,
        ReturnCode::Failure,
        ReturnCode::HostLookupFailure,
        ReturnCode::ConnectionFailure,
        ReturnCode::WriteFailure,
        ReturnCode::ReadFailure,
        ReturnCode::ProtocolError,
        ReturnCode::ClientError,
        ReturnCode::ServerError,
        ReturnCode::Error,
        ReturnCode::DataExists,
        ReturnCode::DataDoesNotExist,
        ReturnCode::NotStored,
        ReturnCode::Stored,
        ReturnCode::NotFound,
        ReturnCode::MemoryAllocationFailure,
        ReturnCode::PartialRead,
        ReturnCode::SomeErrors,
        ReturnCode::NoServers,
        ReturnCode::End,
        ReturnCode::Deleted,
        ReturnCode::NotSupported,
        ReturnCode::Timeout,
        ReturnCode::Buffered,
        ReturnCode::BadKeyProvided,
        ReturnCode::ServerMarkedDead,
        ReturnCode::InvalidArguments,
        ReturnCode::KeyTooBig,
        ReturnCode::AuthProblem,
        ReturnCode::AuthFailure,
        ReturnCode::DuplicateServer,
        ReturnCode::ClientClosed,
    ];

    /// Returns the numeric value of the code.
    #[inline]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Looks up a code by its numeric value.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|rc| rc.code() == code)
    }

    /// Looks up a code by its constant name (e.g. `MEMCACHED_NOTSTORED`).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|rc| rc.name() == name)
    }

    /// True for codes that report a completed (or accepted) operation.
    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(
            self,
            ReturnCode::Success
                | ReturnCode::Stored
                | ReturnCode::Deleted
                | ReturnCode::End
                | ReturnCode::Buffered
        )
    }

    /// Constant-style name an embedding host exposes for this code.
    pub const fn name(self) -> &'static str {
        match self {
            ReturnCode::Success => "MEMCACHED_SUCCESS",
            ReturnCode::Failure => "MEMCACHED_FAILURE",
            ReturnCode::HostLookupFailure => "MEMCACHED_HOST_LOOKUP_FAILURE",
            ReturnCode::ConnectionFailure => "MEMCACHED_CONNECTION_FAILURE",
            ReturnCode::WriteFailure => "MEMCACHED_WRITE_FAILURE",
            ReturnCode::ReadFailure => "MEMCACHED_READ_FAILURE",
            ReturnCode::ProtocolError => "MEMCACHED_PROTOCOL_ERROR",
            ReturnCode::ClientError => "MEMCACHED_CLIENT_ERROR",
            ReturnCode::ServerError => "MEMCACHED_SERVER_ERROR",
            ReturnCode::Error => "MEMCACHED_ERROR",
            ReturnCode::DataExists => "MEMCACHED_DATA_EXISTS",
            ReturnCode::DataDoesNotExist => "MEMCACHED_DATA_DOES_NOT_EXIST",
            ReturnCode::NotStored => "MEMCACHED_NOTSTORED",
            ReturnCode::Stored => "MEMCACHED_STORED",
            ReturnCode::NotFound => "MEMCACHED_NOTFOUND",
            ReturnCode::MemoryAllocationFailure => "MEMCACHED_MEMORY_ALLOCATION_FAILURE",
            ReturnCode::PartialRead => "MEMCACHED_PARTIAL_READ",
            ReturnCode::SomeErrors => "MEMCACHED_SOME_ERRORS",
            ReturnCode::NoServers => "MEMCACHED_NO_SERVERS",
            ReturnCode::End => "MEMCACHED_END",
            ReturnCode::Deleted => "MEMCACHED_DELETED",
            ReturnCode::NotSupported => "MEMCACHED_NOT_SUPPORTED",
            ReturnCode::Timeout => "MEMCACHED_TIMEOUT",
            ReturnCode::Buffered => "MEMCACHED_BUFFERED",
            ReturnCode::BadKeyProvided => "MEMCACHED_BAD_KEY_PROVIDED",
            ReturnCode::ServerMarkedDead => "MEMCACHED_SERVER_MARKED_DEAD",
            ReturnCode::InvalidArguments => "MEMCACHED_INVALID_ARGUMENTS",
            ReturnCode::KeyTooBig => "MEMCACHED_KEY_TOO_BIG",
            ReturnCode::AuthProblem => "MEMCACHED_AUTH_PROBLEM",
            ReturnCode::AuthFailure => "MEMCACHED_AUTH_FAILURE",
            ReturnCode::DuplicateServer => "MEMCACHED_DUPLICATE_SERVER",
            ReturnCode::ClientClosed => "MEMCACHED_CLIENT_CLOSED",
        }
    }

    /// Human-readable description of the code.
    pub const fn description(self) -> &'static str {
        match self {
            ReturnCode::Success => "SUCCESS",
            ReturnCode::Failure => "FAILURE",
            ReturnCode::HostLookupFailure => "HOSTNAME LOOKUP FAILURE",
            ReturnCode::ConnectionFailure => "CONNECTION FAILURE",
            ReturnCode::WriteFailure => "WRITE FAILURE",
            ReturnCode::ReadFailure => "READ FAILURE",
            ReturnCode::ProtocolError => "PROTOCOL ERROR",
            ReturnCode::ClientError => "CLIENT ERROR",
            ReturnCode::ServerError => "SERVER ERROR",
            ReturnCode::Error => "COMMAND NOT RECOGNIZED BY SERVER",
            ReturnCode::DataExists => "CONNECTION DATA EXISTS",
            ReturnCode::DataDoesNotExist => "CONNECTION DATA DOES NOT EXIST",
            ReturnCode::NotStored => "NOT STORED",
            ReturnCode::Stored => "STORED",
            ReturnCode::NotFound => "NOT FOUND",
            ReturnCode::MemoryAllocationFailure => "MEMORY ALLOCATION FAILURE",
            ReturnCode::PartialRead => "PARTIAL READ",
            ReturnCode::SomeErrors => "SOME ERRORS WERE REPORTED",
            ReturnCode::NoServers => "NO SERVERS DEFINED",
            ReturnCode::End => "SERVER END",
            ReturnCode::Deleted => "SERVER DELETE",
            ReturnCode::NotSupported => "ACTION NOT SUPPORTED",
            ReturnCode::Timeout => "A TIMEOUT OCCURRED",
            ReturnCode::Buffered => "ACTION QUEUED",
            ReturnCode::BadKeyProvided => "A BAD KEY WAS PROVIDED/CHARACTERS OUT OF RANGE",
            ReturnCode::ServerMarkedDead => "SERVER IS MARKED DEAD",
            ReturnCode::InvalidArguments => "INVALID ARGUMENTS",
            ReturnCode::KeyTooBig => "KEY IS TOO BIG",
            ReturnCode::AuthProblem => "AUTHENTICATION PROBLEM",
            ReturnCode::AuthFailure => "AUTHENTICATION FAILURE",
            ReturnCode::DuplicateServer => "SERVER ALREADY CONFIGURED",
            ReturnCode::ClientClosed => "CLIENT HAS BEEN CLOSED",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Hard failures surfaced as `Err`.
///
/// Configuration mistakes and protocol violations land here; everything a
/// caller is expected to branch on (misses, not-stored, timeouts) is an
/// `Outcome` instead.
#[derive(Debug, Error)]
pub enum MemcError {
    /// Malformed server spec, config document, or argument value.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// Host name could not be resolved.
    #[error("host lookup failure: {0}")]
    HostLookup(String),
    /// `host:port` is already part of the server list.
    #[error("server {0} is already configured")]
    DuplicateServer(String),
    /// Operation issued before any server was configured.
    #[error("no servers configured")]
    NoServers,
    /// Empty key or key with characters the wire protocol cannot carry.
    #[error("bad key provided")]
    BadKey,
    /// Key exceeds the protocol limit.
    #[error("key is {0} bytes, limit is 250")]
    KeyTooBig(usize),
    /// Behavior flag or value that is recognised but not implemented.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// Operation issued after `close`.
    #[error("client is closed")]
    Closed,
    /// Server reply did not match any known grammar.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Server reported it ran out of memory for the item.
    #[error("server memory allocation failure")]
    MemoryAllocation,
}

impl MemcError {
    /// Maps the error onto the shared outcome taxonomy.
    pub fn code(&self) -> ReturnCode {
        match self {
            MemcError::InvalidArguments(_) => ReturnCode::InvalidArguments,
            MemcError::HostLookup(_) => ReturnCode::HostLookupFailure,
            MemcError::DuplicateServer(_) => ReturnCode::DuplicateServer,
            MemcError::NoServers => ReturnCode::NoServers,
            MemcError::BadKey => ReturnCode::BadKeyProvided,
            MemcError::KeyTooBig(_) => ReturnCode::KeyTooBig,
            MemcError::NotSupported(_) => ReturnCode::NotSupported,
            MemcError::Closed => ReturnCode::ClientClosed,
            MemcError::Protocol(_) => ReturnCode::ProtocolError,
            MemcError::MemoryAllocation => ReturnCode::MemoryAllocationFailure,
        }
    }

    /// True for caller/configuration mistakes (as opposed to protocol faults).
    pub fn is_config(&self) -> bool {
        !matches!(self, MemcError::Protocol(_) | MemcError::MemoryAllocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_numbers_and_names() {
        for rc in ReturnCode::ALL {
            assert_eq!(ReturnCode::from_code(rc.code()), Some(rc));
            assert_eq!(ReturnCode::from_name(rc.name()), Some(rc));
        }
        assert_eq!(ReturnCode::from_code(4), None);
        assert_eq!(ReturnCode::from_name("MEMCACHED_BOGUS"), None);
    }

    #[test]
    fn stable_values_for_host_constants() {
        assert_eq!(ReturnCode::Success.code(), 0);
        assert_eq!(ReturnCode::NotStored.code(), 14);
        assert_eq!(ReturnCode::NotFound.code(), 16);
        assert_eq!(ReturnCode::Buffered.code(), 32);
        assert_eq!(ReturnCode::NotStored.name(), "MEMCACHED_NOTSTORED");
    }

    #[test]
    fn success_family() {
        assert!(ReturnCode::Stored.is_success());
        assert!(ReturnCode::Buffered.is_success());
        assert!(!ReturnCode::NotStored.is_success());
        assert!(!ReturnCode::NotFound.is_success());
        assert!(!ReturnCode::Timeout.is_success());
    }

    #[test]
    fn errors_map_to_codes() {
        assert_eq!(MemcError::Closed.code(), ReturnCode::ClientClosed);
        assert_eq!(MemcError::KeyTooBig(300).code(), ReturnCode::KeyTooBig);
        assert_eq!(
            MemcError::Protocol("junk".into()).code(),
            ReturnCode::ProtocolError
        );
        assert!(MemcError::Closed.is_config());
        assert!(!MemcError::MemoryAllocation.is_config());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            MemcError::KeyTooBig(251).to_string(),
            "key is 251 bytes, limit is 250"
        );
        assert_eq!(ReturnCode::NotStored.to_string(), "NOT STORED");
    }
}

//! # Transport Errors
//!
//! Purpose: Describe what went wrong below the facade (socket, framing,
//! liveness) so the pool can do failure accounting and the facade can fold
//! the result into a soft `ReturnCode` or a hard `MemcError`.

use std::io;

use memc_common::{MemcError, MemcResult, ReturnCode};
use thiserror::Error;

/// Failure of one request/reply exchange with one server.
#[derive(Debug, Error)]
pub enum WireError {
    /// TCP connect (or UDP bind) failed.
    #[error("connect to {server} failed: {source}")]
    Connect {
        server: String,
        #[source]
        source: io::Error,
    },
    /// Socket write failed or timed out.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    /// Socket read failed, timed out, or hit EOF before a reply started.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    /// Peer closed the stream in the middle of a reply.
    #[error("connection closed mid-reply")]
    PartialRead,
    /// Server is ejected and its retry window has not elapsed.
    #[error("server {0} is marked dead")]
    MarkedDead(String),
    /// Reply that must surface as a hard error.
    #[error(transparent)]
    Fatal(#[from] MemcError),
}

impl WireError {
    /// Soft outcome code for this failure.
    pub fn code(&self) -> ReturnCode {
        match self {
            WireError::Connect { source, .. } if is_timeout(source) => ReturnCode::Timeout,
            WireError::Connect { .. } => ReturnCode::ConnectionFailure,
            WireError::Write(err) if is_timeout(err) => ReturnCode::Timeout,
            WireError::Write(_) => ReturnCode::WriteFailure,
            WireError::Read(err) if is_timeout(err) => ReturnCode::Timeout,
            WireError::Read(_) => ReturnCode::ReadFailure,
            WireError::PartialRead => ReturnCode::PartialRead,
            WireError::MarkedDead(_) => ReturnCode::ServerMarkedDead,
            WireError::Fatal(err) => err.code(),
        }
    }

    /// True for failures that count against the server's health.
    pub fn is_server_failure(&self) -> bool {
        !matches!(self, WireError::Fatal(_) | WireError::MarkedDead(_))
    }

    /// Hard errors go to `Err`, everything else becomes an outcome code.
    pub fn into_code(self) -> MemcResult<ReturnCode> {
        match self {
            WireError::Fatal(err) => Err(err),
            other => Ok(other.code()),
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

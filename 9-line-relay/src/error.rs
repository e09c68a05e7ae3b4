use std::io;

use thiserror::Error;

/// Failures surfaced by the relay itself. Only binding is fatal; everything
/// that happens on a single connection stays inside that connection's handler.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read listener address")]
    LocalAddr(#[source] io::Error),
}

/// Per-connection I/O failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to read from peer")]
    Read(#[source] io::Error),
    #[error("peer sent a line that is not valid UTF-8")]
    InvalidUtf8,
    #[error("peer sent a line longer than {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("failed to write to peer")]
    Write(#[source] io::Error),
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    /// True for failures on the write path, which tear down the target
    /// session rather than the sender.
    pub fn is_write_error(&self) -> bool {
        matches!(self, SessionError::Write(_) | SessionError::Closed)
    }
}

//! Transport and protocol error types.

use std::io;

use thiserror::Error;

/// Failures on the byte channel itself.
///
/// Everything the OS can throw collapses into cases the caller can act on:
/// a dead handle (`ConnectionLost`), an expired deadline (`Timeout`, the
/// handle stays usable), or a connect-time refusal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("operation timed out")]
    Timeout,

    #[error("not connected")]
    NotConnected,
}

impl TransportError {
    /// Classify a mid-stream I/O error. A kernel-reported timeout keeps the
    /// handle alive; anything else invalidates it.
    pub fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            _ => TransportError::ConnectionLost(e.to_string()),
        }
    }

    /// Classify a connect-time I/O error. A missing socket path and a
    /// socket nobody is accepting on are the same thing to the caller.
    pub fn from_connect_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
                TransportError::ConnectionRefused(e.to_string())
            }
            _ => TransportError::from_io(e),
        }
    }
}

/// HTTP framing failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("{what} exceeds {limit} bytes")]
    Oversize { what: &'static str, limit: usize },
}

/// Any failure while moving one message across the channel.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

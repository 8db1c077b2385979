//! Host-side client error taxonomy.

use serde_json::Value;
use thiserror::Error;
use vserial_proto::envelope::{Code, ResponseEnvelope};
use vserial_proto::error::{ProtocolError, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    /// Channel-level failure; retried under the client policy.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Peer sent bytes that do not frame as HTTP; never retried.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The guest answered with a non-zero envelope code; never retried.
    #[error("server error {code}: {message}")]
    Server {
        code: i32,
        message: String,
        data: Value,
    },

    /// The response body did not decode as an envelope.
    #[error("response did not decode: {0}")]
    Decode(#[from] serde_json::Error),

    /// Local failure in a convenience wrapper (file I/O, digest mismatch).
    #[error("{0}")]
    Local(String),
}

impl ClientError {
    pub fn from_envelope(env: ResponseEnvelope) -> Self {
        ClientError::Server {
            code: env.code,
            message: env.message,
            data: env.data,
        }
    }

    /// Transport faults are retried; everything else reaches the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(TransportError::ConnectionLost(_))
                | ClientError::Transport(TransportError::Timeout)
        )
    }

    /// Envelope code for reporting: the server's own code, or the
    /// synthesized transport codes when no envelope was obtained.
    pub fn envelope_code(&self) -> i32 {
        match self {
            ClientError::Server { code, .. } => *code,
            ClientError::Transport(TransportError::Timeout) => Code::ReadTimeout.value(),
            ClientError::Transport(_) => Code::ConnectionLost.value(),
            ClientError::Protocol(_) | ClientError::Decode(_) | ClientError::Local(_) => {
                Code::InternalError.value()
            }
        }
    }
}

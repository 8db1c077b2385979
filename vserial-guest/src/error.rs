//! Handler failure type mapped into response envelopes.

use thiserror::Error;
use vserial_proto::envelope::Code;

/// A handler-reported failure: the envelope code plus a bounded detail
/// string. Handlers never panic their way out; everything they can fail
/// with becomes one of these.
#[derive(Debug, Error)]
#[error("{detail}")]
pub struct HandlerError {
    pub code: Code,
    pub detail: String,
}

impl HandlerError {
    pub fn new(code: Code, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(Code::InvalidParams, detail)
    }

    pub fn missing(field: &str) -> Self {
        Self::new(Code::MissingRequired, format!("missing required field: {field}"))
    }

    pub fn permission_denied(detail: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, detail)
    }

    pub fn file_not_found(detail: impl Into<String>) -> Self {
        Self::new(Code::FileNotFound, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(Code::InternalError, detail)
    }

    /// Human-readable envelope `message` for this failure class.
    pub fn message(&self) -> &'static str {
        match self.code {
            Code::Ok => "ok",
            Code::CmdExecFailed => "command execution failed",
            Code::CmdTimeout => "command timed out",
            Code::CmdNotFound => "command not found",
            Code::InvalidParams => "invalid parameters",
            Code::JsonParseError => "invalid json body",
            Code::MissingRequired => "missing required field",
            Code::EndpointNotFound => "endpoint not found",
            Code::FileNotFound => "file not found",
            Code::PermissionDenied => "permission denied",
            Code::InternalError => "internal error",
            Code::ServiceUnavailable => "service unavailable",
            Code::ConnectionLost => "connection lost",
            Code::ReadTimeout => "read timed out",
        }
    }
}

/// What a successful handler hands back: the envelope `message` and the
/// `data` payload.
#[derive(Debug, Clone)]
pub struct Reply {
    pub message: String,
    pub data: serde_json::Value,
}

impl Reply {
    pub fn new(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message: message.into(),
            data,
        }
    }
}

pub type HandlerResult = Result<Reply, HandlerError>;

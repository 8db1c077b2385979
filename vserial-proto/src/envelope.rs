//! JSON envelope carried inside every HTTP body.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Envelope schema version.
pub const VERSION: &str = "1.0";

/// Largest file slice one `file/download` response carries; larger files
/// move as a sequence of offset/length chunks.
pub const MAX_CHUNK: u64 = 1024 * 1024;

/// Result codes for the response envelope.
///
/// Zero is success. 1xxx command execution, 2xxx request shape, 3xxx
/// resources, 4xxx access, 5xxx server, 6xxx transport (6xxx are
/// synthesized on the host side when no envelope could be obtained).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok,
    CmdExecFailed,
    CmdTimeout,
    CmdNotFound,
    InvalidParams,
    JsonParseError,
    MissingRequired,
    EndpointNotFound,
    FileNotFound,
    PermissionDenied,
    InternalError,
    ServiceUnavailable,
    ConnectionLost,
    ReadTimeout,
}

impl Code {
    pub const fn value(self) -> i32 {
        match self {
            Code::Ok => 0,
            Code::CmdExecFailed => 1001,
            Code::CmdTimeout => 1002,
            Code::CmdNotFound => 1003,
            Code::InvalidParams => 2001,
            Code::JsonParseError => 2002,
            Code::MissingRequired => 2003,
            Code::EndpointNotFound => 3001,
            Code::FileNotFound => 3002,
            Code::PermissionDenied => 4001,
            Code::InternalError => 5001,
            Code::ServiceUnavailable => 5002,
            Code::ConnectionLost => 6001,
            Code::ReadTimeout => 6002,
        }
    }

    pub fn from_value(v: i32) -> Option<Self> {
        let code = match v {
            0 => Code::Ok,
            1001 => Code::CmdExecFailed,
            1002 => Code::CmdTimeout,
            1003 => Code::CmdNotFound,
            2001 => Code::InvalidParams,
            2002 => Code::JsonParseError,
            2003 => Code::MissingRequired,
            3001 => Code::EndpointNotFound,
            3002 => Code::FileNotFound,
            4001 => Code::PermissionDenied,
            5001 => Code::InternalError,
            5002 => Code::ServiceUnavailable,
            6001 => Code::ConnectionLost,
            6002 => Code::ReadTimeout,
            _ => return None,
        };
        Some(code)
    }

    /// Stable tag used as `data.error_type` in error envelopes.
    pub const fn error_type(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::CmdExecFailed => "CMD_EXEC_FAILED",
            Code::CmdTimeout => "CMD_TIMEOUT",
            Code::CmdNotFound => "CMD_NOT_FOUND",
            Code::InvalidParams => "INVALID_PARAMS",
            Code::JsonParseError => "JSON_PARSE_ERROR",
            Code::MissingRequired => "MISSING_REQUIRED",
            Code::EndpointNotFound => "ENDPOINT_NOT_FOUND",
            Code::FileNotFound => "FILE_NOT_FOUND",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::InternalError => "INTERNAL_ERROR",
            Code::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Code::ConnectionLost => "CONNECTION_LOST",
            Code::ReadTimeout => "READ_TIMEOUT",
        }
    }
}

/// Request body: `version`, optional handler-interpreted `action` and
/// `params`, optional caller timeout in seconds (bounded by server policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default = "empty_object")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn default_version() -> String {
    VERSION.to_string()
}

fn empty_object() -> Value {
    json!({})
}

impl Default for RequestEnvelope {
    fn default() -> Self {
        Self {
            version: default_version(),
            action: None,
            params: empty_object(),
            timeout: None,
        }
    }
}

impl RequestEnvelope {
    pub fn with_params(params: Value) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a request body. An empty body is a valid empty envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes)
    }
}

/// Response body: `code` 0 on success, a `Code` value otherwise; `data`
/// carries the handler payload or `{error_type, detail}` on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub version: String,
    pub code: i32,
    pub message: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    pub timestamp: i64,
}

impl ResponseEnvelope {
    pub fn success(message: impl Into<String>, data: Value) -> Self {
        Self {
            version: VERSION.to_string(),
            code: Code::Ok.value(),
            message: message.into(),
            data,
            timestamp: unix_timestamp(),
        }
    }

    /// Build an error envelope with the standard `{error_type, detail}`
    /// data object.
    pub fn failure(code: Code, message: impl Into<String>, detail: impl Into<String>) -> Self {
        let detail: String = detail.into();
        Self {
            version: VERSION.to_string(),
            code: code.value(),
            message: message.into(),
            data: json!({
                "error_type": code.error_type(),
                "detail": detail,
            }),
            timestamp: unix_timestamp(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Ok.value()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Current wall clock as Unix seconds.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

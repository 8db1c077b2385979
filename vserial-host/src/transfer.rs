//! Typed convenience wrappers over the raw request API.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use vserial_proto::envelope::{MAX_CHUNK, RequestEnvelope, ResponseEnvelope};
use vserial_proto::http::Method;

use crate::client::Client;
use crate::error::ClientError;

/// Slack added to the read deadline when the caller sets a handler
/// timeout, covering the guest's kill grace.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Result of `shell/exec`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub truncated: bool,
}

/// Result of `file/info`.
#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    pub exists: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, rename = "type")]
    pub file_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mtime: Option<i64>,
    #[serde(default)]
    pub md5: Option<String>,
}

/// Outcome of a verified upload or download.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub bytes: u64,
    pub md5: String,
}

#[derive(Debug, Deserialize)]
struct ChunkData {
    content: String,
    size: u64,
    total_size: u64,
    md5: String,
}

impl Client {
    /// `GET /api/v1/ping`
    pub async fn ping(&self) -> Result<ResponseEnvelope, ClientError> {
        self.request(Method::Get, "/api/v1/ping", None, None).await
    }

    /// `GET /api/v1/system/info`
    pub async fn get_system_info(&self) -> Result<Value, ClientError> {
        let env = self
            .request(Method::Get, "/api/v1/system/info", None, None)
            .await?;
        Ok(env.data)
    }

    /// `GET /api/v1/system/status`
    pub async fn get_system_status(&self) -> Result<Value, ClientError> {
        let env = self
            .request(Method::Get, "/api/v1/system/status", None, None)
            .await?;
        Ok(env.data)
    }

    /// Run a command on the guest under its exec policy.
    pub async fn exec_command(
        &self,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> Result<ExecResult, ClientError> {
        let body = RequestEnvelope {
            params: json!({"command": command}),
            timeout: timeout_secs,
            ..Default::default()
        };
        // the read deadline must outlive the handler deadline
        let read_timeout = timeout_secs.map(|t| Duration::from_secs(t) + TIMEOUT_MARGIN);
        let env = self
            .request(Method::Post, "/api/v1/shell/exec", Some(&body), read_timeout)
            .await?;
        Ok(serde_json::from_value(env.data)?)
    }

    /// `GET /api/v1/file/info?path=…`
    pub async fn file_info(&self, remote: &str) -> Result<FileInfo, ClientError> {
        let path = format!("/api/v1/file/info?path={remote}");
        let env = self.request(Method::Get, &path, None, None).await?;
        Ok(serde_json::from_value(env.data)?)
    }

    /// `POST /api/v1/service/control`
    pub async fn service_control(&self, action: &str, unit: &str) -> Result<Value, ClientError> {
        let body = RequestEnvelope {
            action: Some(action.to_string()),
            params: json!({"unit": unit}),
            ..Default::default()
        };
        let env = self
            .request(Method::Post, "/api/v1/service/control", Some(&body), None)
            .await?;
        Ok(env.data)
    }

    /// Upload a local file and verify the guest-computed MD5 against the
    /// local digest.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<TransferReport, ClientError> {
        let content = tokio::fs::read(local)
            .await
            .map_err(|e| ClientError::Local(format!("cannot read {}: {e}", local.display())))?;
        let local_md5 = hex::encode(Md5::digest(&content));

        let body = RequestEnvelope::with_params(json!({
            "path": remote,
            "content": BASE64.encode(&content),
        }));
        let env = self
            .request(Method::Post, "/api/v1/file/upload", Some(&body), None)
            .await?;

        let remote_md5 = env.data["md5"].as_str().unwrap_or_default().to_string();
        if remote_md5 != local_md5 {
            return Err(ClientError::Local(format!(
                "upload digest mismatch: local {local_md5}, remote {remote_md5}"
            )));
        }

        info!(local = %local.display(), remote, bytes = content.len(), "upload verified");
        Ok(TransferReport {
            bytes: content.len() as u64,
            md5: local_md5,
        })
    }

    /// Download a guest file in `MAX_CHUNK` slices, verifying each chunk's
    /// MD5 and, when the guest reports one, the whole-file MD5.
    pub async fn download_file(&self, remote: &str, local: &Path) -> Result<TransferReport, ClientError> {
        let info = self.file_info(remote).await?;
        if !info.exists {
            return Err(ClientError::Local(format!("remote file does not exist: {remote}")));
        }

        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| ClientError::Local(format!("cannot create {}: {e}", local.display())))?;

        let mut hasher = Md5::new();
        let mut offset = 0u64;
        loop {
            let body = RequestEnvelope::with_params(json!({
                "path": remote,
                "offset": offset,
                "length": MAX_CHUNK,
            }));
            let env = self
                .request(Method::Post, "/api/v1/file/download", Some(&body), None)
                .await?;
            let chunk: ChunkData = serde_json::from_value(env.data)?;

            let content = BASE64
                .decode(&chunk.content)
                .map_err(|e| ClientError::Local(format!("chunk is not valid base64: {e}")))?;
            if content.len() as u64 != chunk.size {
                return Err(ClientError::Local(format!(
                    "chunk size mismatch at offset {offset}: got {}, reported {}",
                    content.len(),
                    chunk.size
                )));
            }
            let chunk_md5 = hex::encode(Md5::digest(&content));
            if chunk_md5 != chunk.md5 {
                return Err(ClientError::Local(format!(
                    "chunk digest mismatch at offset {offset}"
                )));
            }

            hasher.update(&content);
            file.write_all(&content)
                .await
                .map_err(|e| ClientError::Local(format!("write failed: {e}")))?;
            offset += chunk.size;

            debug!(remote, offset, total = chunk.total_size, "chunk received");
            if offset >= chunk.total_size || chunk.size == 0 {
                break;
            }
        }

        file.flush()
            .await
            .map_err(|e| ClientError::Local(format!("flush failed: {e}")))?;

        let md5 = hex::encode(hasher.finalize());
        if let Some(expected) = &info.md5 {
            if *expected != md5 {
                return Err(ClientError::Local(format!(
                    "file digest mismatch: expected {expected}, got {md5}"
                )));
            }
        }

        info!(remote, local = %local.display(), bytes = offset, "download verified");
        Ok(TransferReport { bytes: offset, md5 })
    }
}

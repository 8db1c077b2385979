//! File transfer handlers: upload, download, info.
//!
//! Large files move as application-level chunks (offset/length), so a
//! single response body never exceeds `MAX_CHUNK` of content.

use std::io::SeekFrom;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use nix::unistd::{Gid, Group, Uid, User, chown};
use serde_json::{Value, json};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use vserial_proto::envelope::{Code, MAX_CHUNK};

use crate::error::{HandlerError, HandlerResult, Reply};
use crate::policy::PathPolicy;
use crate::router::{Handler, HandlerContext};

/// Files beyond this size skip the info digest.
pub const MD5_CAP: u64 = 64 * 1024 * 1024;

/// `POST /api/v1/file/upload`
pub struct FileUploadHandler {
    paths: Arc<PathPolicy>,
}

impl FileUploadHandler {
    pub fn new(paths: Arc<PathPolicy>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl Handler for FileUploadHandler {
    async fn call(&self, ctx: &HandlerContext) -> HandlerResult {
        let path = ctx.require_str("path")?;
        let content_b64 = ctx.require_str("content")?;
        let canonical = self.paths.check_write(Path::new(path))?;

        let content = BASE64
            .decode(content_b64)
            .map_err(|e| HandlerError::invalid_params(format!("content is not valid base64: {e}")))?;

        let overwrite = ctx
            .params
            .get("overwrite")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !overwrite && fs::try_exists(&canonical).await.unwrap_or(false) {
            return Err(HandlerError::invalid_params(format!(
                "file exists and overwrite is false: {}",
                canonical.display()
            )));
        }

        fs::write(&canonical, &content)
            .await
            .map_err(|e| io_error(&canonical, e))?;

        if let Some(mode) = ctx.params.get("mode") {
            let mode = parse_mode(mode)?;
            fs::set_permissions(&canonical, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| io_error(&canonical, e))?;
        }

        let owner = ctx.params.get("owner").and_then(Value::as_str).map(String::from);
        let group = ctx.params.get("group").and_then(Value::as_str).map(String::from);
        if owner.is_some() || group.is_some() {
            let target = canonical.clone();
            tokio::task::spawn_blocking(move || apply_ownership(&target, owner, group))
                .await
                .map_err(|e| HandlerError::internal(format!("ownership task failed: {e}")))??;
        }

        Ok(Reply::new(
            "file uploaded",
            json!({
                "path": canonical,
                "size": content.len(),
                "md5": hex::encode(Md5::digest(&content)),
            }),
        ))
    }
}

/// `POST /api/v1/file/download`
pub struct FileDownloadHandler {
    paths: Arc<PathPolicy>,
}

impl FileDownloadHandler {
    pub fn new(paths: Arc<PathPolicy>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl Handler for FileDownloadHandler {
    async fn call(&self, ctx: &HandlerContext) -> HandlerResult {
        let path = ctx.require_str("path")?;
        let canonical = self.paths.check_read(Path::new(path))?;

        let offset = match ctx.params.get("offset") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| HandlerError::invalid_params("offset must be a non-negative integer"))?,
        };
        let length = match ctx.params.get("length") {
            None | Some(Value::Null) => MAX_CHUNK,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| HandlerError::invalid_params("length must be a positive integer"))?,
        };
        if length == 0 || length > MAX_CHUNK {
            return Err(HandlerError::invalid_params(format!(
                "length must be within 1..={MAX_CHUNK}"
            )));
        }

        let mut file = fs::File::open(&canonical)
            .await
            .map_err(|e| io_error(&canonical, e))?;
        let meta = file.metadata().await.map_err(|e| io_error(&canonical, e))?;
        if !meta.is_file() {
            return Err(HandlerError::invalid_params(format!(
                "not a regular file: {}",
                canonical.display()
            )));
        }
        let total = meta.len();

        let want = length.min(total.saturating_sub(offset)) as usize;
        let mut buf = vec![0u8; want];
        if want > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| io_error(&canonical, e))?;
            file.read_exact(&mut buf)
                .await
                .map_err(|e| io_error(&canonical, e))?;
        }

        Ok(Reply::new(
            "file chunk",
            json!({
                "content": BASE64.encode(&buf),
                "size": buf.len(),
                "total_size": total,
                "md5": hex::encode(Md5::digest(&buf)),
            }),
        ))
    }
}

/// `GET /api/v1/file/info?path=…`
pub struct FileInfoHandler {
    paths: Arc<PathPolicy>,
}

impl FileInfoHandler {
    pub fn new(paths: Arc<PathPolicy>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl Handler for FileInfoHandler {
    async fn call(&self, ctx: &HandlerContext) -> HandlerResult {
        let path = ctx
            .query
            .get("path")
            .ok_or_else(|| HandlerError::missing("path"))?;

        let canonical = match self.paths.check_read(Path::new(path)) {
            Ok(p) => p,
            Err(e) if e.code == Code::FileNotFound => {
                return Ok(Reply::new("file info", json!({"exists": false, "path": path})));
            }
            Err(e) => return Err(e),
        };

        let meta = match fs::metadata(&canonical).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Reply::new("file info", json!({"exists": false, "path": path})));
            }
            Err(e) => return Err(io_error(&canonical, e)),
        };

        let file_type = if meta.is_file() {
            "file"
        } else if meta.is_dir() {
            "directory"
        } else {
            "other"
        };

        let md5 = if meta.is_file() && meta.len() <= MD5_CAP {
            Value::String(file_md5(&canonical).await?)
        } else {
            Value::Null
        };

        let (uid, gid) = (meta.uid(), meta.gid());
        let (owner, group) = tokio::task::spawn_blocking(move || names_for(uid, gid))
            .await
            .map_err(|e| HandlerError::internal(format!("lookup task failed: {e}")))?;

        Ok(Reply::new(
            "file info",
            json!({
                "exists": true,
                "path": canonical,
                "type": file_type,
                "size": meta.len(),
                "mode": format!("{:04o}", meta.mode() & 0o7777),
                "owner": owner,
                "group": group,
                "mtime": meta.mtime(),
                "md5": md5,
            }),
        ))
    }
}

fn io_error(path: &Path, e: std::io::Error) -> HandlerError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            HandlerError::file_not_found(format!("no such file: {}", path.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            HandlerError::permission_denied(format!("access denied: {}", path.display()))
        }
        _ => HandlerError::internal(format!("{}: {e}", path.display())),
    }
}

/// Accept `"0644"`-style octal strings or raw mode-bit integers.
fn parse_mode(v: &Value) -> Result<u32, HandlerError> {
    match v {
        Value::String(s) => u32::from_str_radix(s.trim_start_matches("0o"), 8)
            .map_err(|_| HandlerError::invalid_params(format!("bad mode: {s:?}"))),
        Value::Number(n) => n
            .as_u64()
            .filter(|m| *m <= 0o7777)
            .map(|m| m as u32)
            .ok_or_else(|| HandlerError::invalid_params(format!("bad mode: {n}"))),
        _ => Err(HandlerError::invalid_params("mode must be a string or integer")),
    }
}

fn apply_ownership(
    path: &Path,
    owner: Option<String>,
    group: Option<String>,
) -> Result<(), HandlerError> {
    let uid = match owner {
        Some(name) => Some(
            User::from_name(&name)
                .ok()
                .flatten()
                .map(|u| u.uid)
                .ok_or_else(|| HandlerError::invalid_params(format!("unknown owner: {name}")))?,
        ),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(
            Group::from_name(&name)
                .ok()
                .flatten()
                .map(|g| g.gid)
                .ok_or_else(|| HandlerError::invalid_params(format!("unknown group: {name}")))?,
        ),
        None => None,
    };
    chown(path, uid, gid).map_err(|e| match e {
        nix::errno::Errno::EPERM => {
            HandlerError::permission_denied(format!("chown denied: {}", path.display()))
        }
        _ => HandlerError::internal(format!("chown failed: {e}")),
    })
}

fn names_for(uid: u32, gid: u32) -> (String, String) {
    let owner = User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string());
    let group = Group::from_gid(Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| gid.to_string());
    (owner, group)
}

/// Streamed digest so a capped-size file never sits in memory whole.
async fn file_md5(path: &Path) -> Result<String, HandlerError> {
    let mut file = fs::File::open(path).await.map_err(|e| io_error(path, e))?;
    let mut hasher = Md5::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut chunk).await.map_err(|e| io_error(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::policy::AllowedPath;

    struct Sandbox {
        _dir: tempfile::TempDir,
        base: std::path::PathBuf,
        paths: Arc<PathPolicy>,
    }

    fn sandbox() -> Sandbox {
        let dir = tempfile::TempDir::new().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let paths = Arc::new(PathPolicy::new(vec![AllowedPath::writable(&base)]));
        Sandbox { _dir: dir, base, paths }
    }

    fn ctx(params: Value) -> HandlerContext {
        HandlerContext {
            query: HashMap::new(),
            action: None,
            params,
            request_id: "r1".into(),
            deadline: Instant::now() + Duration::from_secs(5),
        }
    }

    fn query_ctx(key: &str, value: &str) -> HandlerContext {
        let mut query = HashMap::new();
        query.insert(key.to_string(), value.to_string());
        HandlerContext {
            query,
            action: None,
            params: json!({}),
            request_id: "r1".into(),
            deadline: Instant::now() + Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn upload_writes_and_reports_md5() {
        let sb = sandbox();
        let target = sb.base.join("hello.txt");
        let content = b"hello upload";

        let reply = FileUploadHandler::new(sb.paths.clone())
            .call(&ctx(json!({
                "path": target,
                "content": BASE64.encode(content),
                "mode": "0600",
            })))
            .await
            .unwrap();

        assert_eq!(reply.data["size"], content.len());
        assert_eq!(
            reply.data["md5"].as_str().unwrap(),
            hex::encode(Md5::digest(content))
        );
        assert_eq!(std::fs::read(&target).unwrap(), content);
        let mode = std::fs::metadata(&target).unwrap().mode() & 0o7777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn upload_is_idempotent_for_identical_content() {
        let sb = sandbox();
        let target = sb.base.join("idem.bin");
        let params = json!({
            "path": target,
            "content": BASE64.encode(b"same bytes"),
            "overwrite": true,
        });

        let handler = FileUploadHandler::new(sb.paths.clone());
        let first = handler.call(&ctx(params.clone())).await.unwrap();
        let second = handler.call(&ctx(params)).await.unwrap();
        assert_eq!(first.data["md5"], second.data["md5"]);
    }

    #[tokio::test]
    async fn upload_missing_parent_is_file_not_found() {
        let sb = sandbox();
        let err = FileUploadHandler::new(sb.paths.clone())
            .call(&ctx(json!({
                "path": sb.base.join("no-dir/x.bin"),
                "content": BASE64.encode(b"x"),
            })))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::FileNotFound);
    }

    #[tokio::test]
    async fn upload_rejects_bad_base64_and_refused_overwrite() {
        let sb = sandbox();
        let handler = FileUploadHandler::new(sb.paths.clone());
        let target = sb.base.join("f");

        let err = handler
            .call(&ctx(json!({"path": target, "content": "%%%"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidParams);

        std::fs::write(&target, b"old").unwrap();
        let err = handler
            .call(&ctx(json!({
                "path": target,
                "content": BASE64.encode(b"new"),
                "overwrite": false,
            })))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidParams);
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
    }

    #[tokio::test]
    async fn download_chunks_concatenate_to_the_whole() {
        let sb = sandbox();
        let target = sb.base.join("blob.bin");
        let content: Vec<u8> = (0..150 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&target, &content).unwrap();

        let handler = FileDownloadHandler::new(sb.paths.clone());
        let mut assembled = Vec::new();
        for (offset, length) in [(0u64, 65536u64), (65536, 65536), (131072, 22528)] {
            let reply = handler
                .call(&ctx(json!({"path": target, "offset": offset, "length": length})))
                .await
                .unwrap();
            let chunk = BASE64.decode(reply.data["content"].as_str().unwrap()).unwrap();
            assert_eq!(
                reply.data["md5"].as_str().unwrap(),
                hex::encode(Md5::digest(&chunk))
            );
            assert_eq!(reply.data["total_size"], content.len());
            assembled.extend_from_slice(&chunk);
        }
        assert_eq!(assembled, content);
    }

    #[tokio::test]
    async fn download_bounds() {
        let sb = sandbox();
        let target = sb.base.join("small.bin");
        std::fs::write(&target, b"0123456789").unwrap();
        let handler = FileDownloadHandler::new(sb.paths.clone());

        // offset past the end returns an empty chunk
        let reply = handler
            .call(&ctx(json!({"path": target, "offset": 100, "length": 10})))
            .await
            .unwrap();
        assert_eq!(reply.data["size"], 0);
        assert_eq!(reply.data["total_size"], 10);

        for bad in [json!(0), json!(MAX_CHUNK + 1)] {
            let err = handler
                .call(&ctx(json!({"path": target, "length": bad})))
                .await
                .unwrap_err();
            assert_eq!(err.code, Code::InvalidParams);
        }

        let err = handler
            .call(&ctx(json!({"path": sb.base.join("missing"), "length": 10})))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::FileNotFound);
    }

    #[tokio::test]
    async fn info_reports_metadata_and_digest() {
        let sb = sandbox();
        let target = sb.base.join("meta.txt");
        std::fs::write(&target, b"some data").unwrap();

        let reply = FileInfoHandler::new(sb.paths.clone())
            .call(&query_ctx("path", target.to_str().unwrap()))
            .await
            .unwrap();
        assert_eq!(reply.data["exists"], true);
        assert_eq!(reply.data["type"], "file");
        assert_eq!(reply.data["size"], 9);
        assert_eq!(
            reply.data["md5"].as_str().unwrap(),
            hex::encode(Md5::digest(b"some data"))
        );
        assert!(reply.data["mode"].as_str().unwrap().len() == 4);
        assert!(reply.data["mtime"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn info_on_missing_and_directory_paths() {
        let sb = sandbox();

        let reply = FileInfoHandler::new(sb.paths.clone())
            .call(&query_ctx("path", sb.base.join("gone").to_str().unwrap()))
            .await
            .unwrap();
        assert_eq!(reply.data["exists"], false);

        let sub = sb.base.join("subdir");
        std::fs::create_dir(&sub).unwrap();
        let reply = FileInfoHandler::new(sb.paths.clone())
            .call(&query_ctx("path", sub.to_str().unwrap()))
            .await
            .unwrap();
        assert_eq!(reply.data["type"], "directory");
        assert!(reply.data["md5"].is_null());
    }

    #[tokio::test]
    async fn info_outside_allowed_paths_is_denied() {
        let sb = sandbox();
        let err = FileInfoHandler::new(sb.paths.clone())
            .call(&query_ctx("path", "/proc/self/status"))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
    }
}

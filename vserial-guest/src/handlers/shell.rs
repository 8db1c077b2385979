//! Policy-checked command execution for `shell/exec`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{Instant, timeout, timeout_at};
use vserial_proto::envelope::Code;

use crate::error::{HandlerError, HandlerResult, Reply};
use crate::policy::{CommandPolicy, PathPolicy};
use crate::router::{Handler, HandlerContext};

/// Capture cap per stream; overflow truncates and flags the response.
pub const MAX_CAPTURE: usize = 1024 * 1024;

/// SIGTERM-to-SIGKILL grace for a child past its deadline.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// PATH handed to children whose caller did not supply one.
const DEFAULT_PATH: &str = "/usr/bin:/bin";

/// `POST /api/v1/shell/exec`
pub struct ShellExecHandler {
    commands: Arc<CommandPolicy>,
    paths: Arc<PathPolicy>,
}

impl ShellExecHandler {
    pub fn new(commands: Arc<CommandPolicy>, paths: Arc<PathPolicy>) -> Self {
        Self { commands, paths }
    }
}

#[async_trait]
impl Handler for ShellExecHandler {
    async fn call(&self, ctx: &HandlerContext) -> HandlerResult {
        let command = ctx.require_str("command")?;
        let argv = self.commands.parse(command)?;

        let env: HashMap<String, String> = match ctx.params.get("env") {
            None | Some(Value::Null) => HashMap::new(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| HandlerError::invalid_params(format!("bad env map: {e}")))?,
        };

        let cwd = match ctx.params.get("cwd").and_then(Value::as_str) {
            Some(dir) => Some(self.paths.check_read(Path::new(dir))?),
            None => None,
        };

        debug!("exec [{}]: {command}", ctx.request_id);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &env {
            cmd.env(k, v);
        }
        if !env.contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                HandlerError::new(Code::CmdNotFound, format!("no such command: {}", argv[0]))
            }
            _ => HandlerError::new(Code::CmdExecFailed, format!("spawn failed: {e}")),
        })?;

        let out_task = tokio::spawn(capture(child.stdout.take()));
        let err_task = tokio::spawn(capture(child.stderr.take()));

        let status = match timeout_at(ctx.deadline, child.wait()).await {
            Ok(status) => status
                .map_err(|e| HandlerError::new(Code::CmdExecFailed, format!("wait failed: {e}")))?,
            Err(_) => {
                warn!("exec [{}]: deadline hit, terminating child", ctx.request_id);
                terminate(&mut child).await;
                return Err(HandlerError::new(
                    Code::CmdTimeout,
                    format!("command exceeded deadline: {command}"),
                ));
            }
        };

        let (stdout, out_truncated) = out_task.await.unwrap_or_default();
        let (stderr, err_truncated) = err_task.await.unwrap_or_default();

        let exit_code = exit_code_of(&status);
        debug!(
            "exec [{}]: exit={exit_code} in {}ms",
            ctx.request_id,
            started.elapsed().as_millis()
        );

        Ok(Reply::new(
            "command completed",
            json!({
                "exit_code": exit_code,
                "stdout": String::from_utf8_lossy(&stdout),
                "stderr": String::from_utf8_lossy(&stderr),
                "duration_ms": started.elapsed().as_millis() as u64,
                "truncated": out_truncated || err_truncated,
            }),
        ))
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Drain one child stream into a bounded buffer.
async fn capture<R: AsyncRead + Unpin>(stream: Option<R>) -> (Vec<u8>, bool) {
    let Some(mut stream) = stream else {
        return (Vec::new(), false);
    };
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < MAX_CAPTURE {
                    let take = n.min(MAX_CAPTURE - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
        }
    }
    (buf, truncated)
}

/// SIGTERM first; SIGKILL if the child is still around after the grace
/// window. The child is reaped before returning.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

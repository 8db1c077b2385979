//! systemd unit control for `service/control`.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use vserial_proto::envelope::Code;

use crate::error::{HandlerError, HandlerResult, Reply};
use crate::router::{Handler, HandlerContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Status,
    Enable,
    Disable,
}

impl ServiceAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "status" => Some(Self::Status),
            "enable" => Some(Self::Enable),
            "disable" => Some(Self::Disable),
            _ => None,
        }
    }

    pub const fn verb(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Status => "status",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

/// `POST /api/v1/service/control`
pub struct ServiceControlHandler;

#[async_trait]
impl Handler for ServiceControlHandler {
    async fn call(&self, ctx: &HandlerContext) -> HandlerResult {
        let action = ctx
            .action
            .as_deref()
            .ok_or_else(|| HandlerError::missing("action"))?;
        let action = ServiceAction::parse(action)
            .ok_or_else(|| HandlerError::invalid_params(format!("unknown action: {action}")))?;
        let unit = ctx.require_str("unit")?;
        validate_unit(unit)?;

        match action {
            ServiceAction::Status => {
                // is-active exits non-zero for inactive units; the state
                // string is the answer either way
                let out = run_systemctl(&["is-active", unit]).await?;
                let state = String::from_utf8_lossy(&out.stdout).trim().to_string();
                Ok(Reply::new(
                    "service status",
                    json!({
                        "unit": unit,
                        "state": if state.is_empty() { "unknown".to_string() } else { state },
                    }),
                ))
            }
            _ => {
                let out = run_systemctl(&[action.verb(), unit]).await?;
                if !out.status.success() {
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    return Err(HandlerError::new(
                        Code::CmdExecFailed,
                        format!("systemctl {} {unit} failed: {}", action.verb(), stderr.trim()),
                    ));
                }
                Ok(Reply::new(
                    "service control",
                    json!({"unit": unit, "action": action.verb(), "result": "ok"}),
                ))
            }
        }
    }
}

async fn run_systemctl(args: &[&str]) -> Result<std::process::Output, HandlerError> {
    Command::new("systemctl")
        .args(args)
        .env_clear()
        .env("PATH", "/usr/bin:/bin")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                HandlerError::new(Code::CmdNotFound, "systemctl is not available")
            }
            _ => HandlerError::new(Code::CmdExecFailed, format!("failed to run systemctl: {e}")),
        })
}

/// Unit names pass through to systemctl untouched, so vet them strictly.
fn validate_unit(unit: &str) -> Result<(), HandlerError> {
    let ok = !unit.is_empty()
        && unit.len() <= 256
        && unit
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@' | ':'));
    if ok {
        Ok(())
    } else {
        Err(HandlerError::invalid_params(format!(
            "invalid unit name: {unit:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde_json::Value;
    use tokio::time::Instant;

    use super::*;

    fn ctx(action: Option<&str>, params: Value) -> HandlerContext {
        HandlerContext {
            query: HashMap::new(),
            action: action.map(String::from),
            params,
            request_id: "r1".into(),
            deadline: Instant::now() + Duration::from_secs(5),
        }
    }

    #[test]
    fn action_parsing() {
        assert_eq!(ServiceAction::parse("restart"), Some(ServiceAction::Restart));
        assert_eq!(ServiceAction::parse("enable"), Some(ServiceAction::Enable));
        assert_eq!(ServiceAction::parse("reload"), None);
    }

    #[test]
    fn unit_validation() {
        assert!(validate_unit("sshd.service").is_ok());
        assert!(validate_unit("user@1000.service").is_ok());
        assert!(validate_unit("dev-sda1.mount").is_ok());
        assert!(validate_unit("").is_err());
        assert!(validate_unit("bad unit").is_err());
        assert!(validate_unit("x; reboot").is_err());
        assert!(validate_unit("a/b").is_err());
    }

    #[tokio::test]
    async fn missing_action_and_bad_action() {
        let err = ServiceControlHandler
            .call(&ctx(None, json!({"unit": "sshd"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::MissingRequired);

        let err = ServiceControlHandler
            .call(&ctx(Some("explode"), json!({"unit": "sshd"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidParams);
    }

    #[tokio::test]
    async fn missing_unit_and_invalid_unit() {
        let err = ServiceControlHandler
            .call(&ctx(Some("status"), json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::MissingRequired);

        let err = ServiceControlHandler
            .call(&ctx(Some("status"), json!({"unit": "x; reboot"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidParams);
    }
}

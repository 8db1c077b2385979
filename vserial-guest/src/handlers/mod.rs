//! Built-in handlers for the guest API.

pub mod file;
pub mod service;
pub mod shell;
pub mod system;

use std::sync::Arc;

use tokio::time::Instant;
use vserial_proto::http::Method;

use crate::GuestConfig;
use crate::policy::{CommandPolicy, PathPolicy};
use crate::router::{DuplicateRoute, RouteOptions, RouterBuilder};

/// Register the built-in API under `/api/v1`. `started` anchors the uptime
/// reported by ping.
pub fn register_builtins(
    builder: &mut RouterBuilder,
    config: &GuestConfig,
    started: Instant,
) -> Result<(), DuplicateRoute> {
    let paths = Arc::new(PathPolicy::new(config.allowed_paths.clone()));
    let commands = Arc::new(CommandPolicy::new(config.allowed_commands.clone()));

    let read = RouteOptions {
        max_body_bytes: 64 * 1024,
        default_timeout: config.request_timeout,
        auth_required: false,
    };
    // side-effecting routes carry the auth flag
    let guarded = RouteOptions {
        auth_required: true,
        ..read.clone()
    };
    let upload = RouteOptions {
        max_body_bytes: config.max_request_size,
        ..guarded.clone()
    };

    builder.register(
        Method::Get,
        "/api/v1/ping",
        Arc::new(system::PingHandler::new(started)),
        read.clone(),
    )?;
    builder.register(
        Method::Get,
        "/api/v1/system/info",
        Arc::new(system::SystemInfoHandler),
        read.clone(),
    )?;
    builder.register(
        Method::Get,
        "/api/v1/system/status",
        Arc::new(system::SystemStatusHandler),
        read.clone(),
    )?;
    builder.register(
        Method::Post,
        "/api/v1/shell/exec",
        Arc::new(shell::ShellExecHandler::new(commands, paths.clone())),
        guarded.clone(),
    )?;
    builder.register(
        Method::Post,
        "/api/v1/file/upload",
        Arc::new(file::FileUploadHandler::new(paths.clone())),
        upload,
    )?;
    builder.register(
        Method::Post,
        "/api/v1/file/download",
        Arc::new(file::FileDownloadHandler::new(paths.clone())),
        guarded.clone(),
    )?;
    builder.register(
        Method::Get,
        "/api/v1/file/info",
        Arc::new(file::FileInfoHandler::new(paths)),
        read,
    )?;
    builder.register(
        Method::Post,
        "/api/v1/service/control",
        Arc::new(service::ServiceControlHandler),
        guarded,
    )?;

    Ok(())
}

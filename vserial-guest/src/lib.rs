//! vserial-guest - in-VM agent for the virtio-serial RPC transport.
//!
//! Owns the character device under `/dev/virtio-ports/`, parses streamed
//! HTTP requests, routes them to policy-guarded handlers, and writes
//! replies back. Survives host disconnect/reconnect; keeps no on-disk
//! state.
//!
//! ## Architecture
//!
//! - **Server**: channel lifecycle state machine and request loop
//! - **Router**: immutable `(method, path)` table built at startup
//! - **Handlers**: ping, system introspection, shell exec, file transfer,
//!   service control
//! - **Policy**: path/command allow-lists, rate limiting, capture caps

pub mod error;
pub mod handlers;
pub mod policy;
pub mod router;
pub mod server;

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use crate::policy::{AllowedPath, RateLimitConfig};
use crate::router::{DuplicateRoute, Router, RouterBuilder};

/// Configuration for the guest agent. A value of this is passed into the
/// constructors; there is no process-wide state.
#[derive(Debug, Clone)]
pub struct GuestConfig {
    /// virtio-serial character device exposed by QEMU.
    pub device_path: PathBuf,
    /// Initial capacity of the channel read buffer.
    pub buffer_size: usize,
    /// Hard cap on any request body.
    pub max_request_size: usize,
    /// Default per-request deadline for routes that do not override it.
    pub request_timeout: Duration,
    /// Enforce the authenticator on guarded routes.
    pub enable_auth: bool,
    /// Command allow-list; empty means the documented defaults.
    pub allowed_commands: Vec<String>,
    /// Path allow-list; empty means the documented defaults.
    pub allowed_paths: Vec<AllowedPath>,
    /// Request rate limiting; `None` disables it.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/virtio-ports/org.vserial.0"),
            buffer_size: 64 * 1024,
            max_request_size: vserial_proto::http::DEFAULT_MAX_BODY_BYTES,
            request_timeout: Duration::from_secs(30),
            enable_auth: false,
            allowed_commands: Vec::new(),
            allowed_paths: Vec::new(),
            rate_limit: Some(RateLimitConfig::default()),
        }
    }
}

/// Build the route table with the built-in API registered. Callers needing
/// extra routes use [`RouterBuilder`] and
/// [`handlers::register_builtins`] directly.
pub fn build_router(config: &GuestConfig, started: Instant) -> Result<Router, DuplicateRoute> {
    let mut builder = RouterBuilder::new();
    handlers::register_builtins(&mut builder, config, started)?;
    Ok(builder.build())
}

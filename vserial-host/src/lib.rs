//! vserial-host - host-side client for the virtio-serial RPC transport.
//!
//! Connects to the Unix socket libvirt/QEMU exposes for a virtio-serial
//! port and speaks the vserial request/response protocol to the guest
//! agent. One channel, one request in flight; reconnects and retries are
//! supervised here so callers see a plain request/response API.

pub mod client;
pub mod error;
pub mod transfer;

use std::path::PathBuf;
use std::time::Duration;

pub use client::Client;
pub use error::ClientError;

/// Configuration for the host client. Passed into [`Client::new`]; there is
/// no process-wide state.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Unix socket path of the virtio-serial channel
    /// (`/var/lib/libvirt/qemu/channel/target/domain-<N>-<name>/<port>`).
    pub socket_path: PathBuf,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Transport-level retries per request.
    pub max_retries: u32,
    /// First retry delay; grows by `backoff_factor` per attempt.
    pub retry_interval: Duration,
    pub backoff_factor: f64,
    /// Reconnect on demand after a disconnect or lost channel.
    pub auto_reconnect: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/lib/libvirt/qemu/channel/target/org.vserial.0"),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
            backoff_factor: 2.0,
            auto_reconnect: true,
        }
    }
}

impl HostConfig {
    pub fn for_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
            ..Default::default()
        }
    }
}

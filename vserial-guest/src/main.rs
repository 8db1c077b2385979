//! vserial-guest - guest-side RPC agent over virtio-serial.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;
use tokio::time::Instant;
use vserial_guest::policy::AllowedPath;
use vserial_guest::server::Server;
use vserial_guest::{GuestConfig, build_router};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Guest-side RPC agent for virtio-serial channels.
#[derive(Parser)]
#[command(name = "vserial-guest")]
#[command(version = VERSION)]
#[command(about = "Guest-side RPC agent for virtio-serial channels")]
struct Args {
    /// Path to the virtio-serial character device
    #[arg(long, default_value = "/dev/virtio-ports/org.vserial.0")]
    device: PathBuf,

    /// Maximum request body size in bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    max_request_size: usize,

    /// Default per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,

    /// Require authentication on guarded routes
    #[arg(long)]
    enable_auth: bool,

    /// Allowed command (repeatable; built-in list when omitted)
    #[arg(long = "allow-command")]
    allowed_commands: Vec<String>,

    /// Allowed writable path prefix (repeatable; built-in list when omitted)
    #[arg(long = "allow-path")]
    allowed_paths: Vec<PathBuf>,

    /// Disable the request rate limiter
    #[arg(long)]
    no_rate_limit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    info!("vserial-guest v{VERSION} starting");

    let defaults = GuestConfig::default();
    let config = GuestConfig {
        device_path: args.device,
        max_request_size: args.max_request_size,
        request_timeout: Duration::from_secs(args.request_timeout.max(1)),
        enable_auth: args.enable_auth,
        allowed_commands: args.allowed_commands,
        allowed_paths: args
            .allowed_paths
            .into_iter()
            .map(AllowedPath::writable)
            .collect(),
        rate_limit: if args.no_rate_limit {
            None
        } else {
            defaults.rate_limit.clone()
        },
        ..defaults
    };

    let started = Instant::now();
    let router = build_router(&config, started)?;
    info!("route table ready ({} routes)", router.len());

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        info!("stop signal received");
        let _ = shutdown_tx.send(()).await;
    });

    Server::new(config, router).run(shutdown_rx).await;

    info!("vserial-guest shutting down");
    Ok(())
}

/// Resolve on SIGTERM or SIGINT.
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("signal setup failed: {e}");
            return std::future::pending::<()>().await;
        }
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("signal setup failed: {e}");
            return std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

//! System introspection handlers: ping, system/info, system/status.
//!
//! Collects from the sysinfo crate plus direct /proc reads, with graceful
//! fallbacks when a source is unavailable.

use std::fs;

use async_trait::async_trait;
use serde_json::{Value, json};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tokio::time::Instant;
use vserial_proto::envelope::unix_timestamp;

use crate::error::{HandlerError, HandlerResult, Reply};
use crate::router::{Handler, HandlerContext};

/// `GET /api/v1/ping`
pub struct PingHandler {
    started: Instant,
}

impl PingHandler {
    pub fn new(started: Instant) -> Self {
        Self { started }
    }
}

#[async_trait]
impl Handler for PingHandler {
    async fn call(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(Reply::new(
            "pong",
            json!({
                "timestamp": unix_timestamp(),
                "uptime": self.started.elapsed().as_secs(),
            }),
        ))
    }
}

/// `GET /api/v1/system/info`
pub struct SystemInfoHandler;

#[async_trait]
impl Handler for SystemInfoHandler {
    async fn call(&self, _ctx: &HandlerContext) -> HandlerResult {
        let data = tokio::task::spawn_blocking(collect_info)
            .await
            .map_err(|e| HandlerError::internal(format!("info collection failed: {e}")))?;
        Ok(Reply::new("system info", data))
    }
}

/// `GET /api/v1/system/status`
pub struct SystemStatusHandler;

#[async_trait]
impl Handler for SystemStatusHandler {
    async fn call(&self, _ctx: &HandlerContext) -> HandlerResult {
        // blocks for one CPU sampling interval, so keep it off the channel task
        let data = tokio::task::spawn_blocking(collect_status)
            .await
            .map_err(|e| HandlerError::internal(format!("status collection failed: {e}")))?;
        Ok(Reply::new("system status", data))
    }
}

fn refreshed_system() -> System {
    System::new_with_specifics(
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything()),
    )
}

fn collect_info() -> Value {
    let sys = refreshed_system();

    let hostname = fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let kernel = fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    json!({
        "hostname": hostname,
        "os": System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
        "kernel": kernel,
        "arch": std::env::consts::ARCH,
        "cpu_count": sys.cpus().len(),
        "memory_total": sys.total_memory(),
        "memory_available": sys.available_memory(),
    })
}

fn collect_status() -> Value {
    let mut sys = refreshed_system();

    // two samples are needed for a meaningful usage figure
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_all();
    sys.refresh_memory();

    let memory_usage = if sys.total_memory() > 0 {
        sys.used_memory() as f64 * 100.0 / sys.total_memory() as f64
    } else {
        0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let mut disk_usage: Vec<Value> = disks
        .iter()
        .map(|d| {
            let total = d.total_space();
            let available = d.available_space();
            let used_percent = if total > 0 {
                (total - available) as f64 * 100.0 / total as f64
            } else {
                0.0
            };
            json!({
                "mount": d.mount_point().to_string_lossy(),
                "total": total,
                "available": available,
                "used_percent": used_percent,
            })
        })
        .collect();
    disk_usage.sort_by(|a, b| a["mount"].as_str().cmp(&b["mount"].as_str()));

    let load = System::load_average();

    json!({
        "cpu_usage": sys.global_cpu_usage(),
        "memory_usage": memory_usage,
        "disk_usage": disk_usage,
        "load_average": [load.one, load.five, load.fifteen],
        "process_count": process_count(),
    })
}

/// Numeric entries under /proc are pids.
fn process_count() -> u64 {
    fs::read_dir("/proc")
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .chars()
                        .all(|c| c.is_ascii_digit())
                })
                .count() as u64
        })
        .unwrap_or(0)
}

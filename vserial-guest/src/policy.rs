//! Allow-list enforcement: paths, commands, and request rate.
//!
//! Every file-handler path and every `shell/exec` argv passes through here
//! before a handler touches the filesystem or spawns a child.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use vserial_proto::envelope::Code;

use crate::error::HandlerError;

/// Commands `shell/exec` accepts when the operator supplies no list.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls",
    "cat",
    "head",
    "tail",
    "grep",
    "df",
    "free",
    "top",
    "ps",
    "netstat",
    "systemctl",
    "service",
    "journalctl",
];

/// Shell metacharacters rejected in any argv element.
const FORBIDDEN_CHARS: &[char] = &['|', '&', ';', '`', '$', '>', '<', '\n', '\r'];

/// Prefixes no file operation may touch, regardless of the allow list.
const ALWAYS_FORBIDDEN: &[&str] = &["/etc/shadow", "/root/", "/proc/", "/sys/"];

/// One allow-list entry: a canonical prefix and whether write-class
/// operations may use it.
#[derive(Debug, Clone)]
pub struct AllowedPath {
    pub prefix: PathBuf,
    pub writable: bool,
}

impl AllowedPath {
    pub fn writable(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            writable: true,
        }
    }

    pub fn read_only(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            writable: false,
        }
    }
}

/// Default allow list: `/tmp/`, `/var/log/`, `/home/` read-write and
/// `/etc/` read-only.
pub fn default_allowed_paths() -> Vec<AllowedPath> {
    vec![
        AllowedPath::writable("/tmp"),
        AllowedPath::writable("/var/log"),
        AllowedPath::writable("/home"),
        AllowedPath::read_only("/etc"),
    ]
}

/// Path canonicalization and prefix checks for the file handlers.
#[derive(Debug)]
pub struct PathPolicy {
    allowed: Vec<AllowedPath>,
    forbidden: Vec<PathBuf>,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::new(default_allowed_paths())
    }
}

impl PathPolicy {
    /// Build a policy from an allow list. The mandatory forbidden prefixes
    /// are always present; an empty allow list falls back to the defaults.
    pub fn new(allowed: Vec<AllowedPath>) -> Self {
        let allowed = if allowed.is_empty() {
            default_allowed_paths()
        } else {
            allowed
        };
        Self {
            allowed,
            forbidden: ALWAYS_FORBIDDEN.iter().map(PathBuf::from).collect(),
        }
    }

    /// Canonicalize and vet a path for a read-class operation.
    pub fn check_read(&self, path: &Path) -> Result<PathBuf, HandlerError> {
        self.check(path, false)
    }

    /// Canonicalize and vet a path for a write-class operation. The target
    /// itself may not exist yet, but its parent directory must.
    pub fn check_write(&self, path: &Path) -> Result<PathBuf, HandlerError> {
        self.check(path, true)
    }

    fn check(&self, path: &Path, write: bool) -> Result<PathBuf, HandlerError> {
        if !path.is_absolute() {
            return Err(HandlerError::permission_denied(format!(
                "path is not absolute: {}",
                path.display()
            )));
        }

        let canonical = canonicalize_target(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                HandlerError::file_not_found(format!("no such path: {}", path.display()))
            } else {
                HandlerError::permission_denied(format!(
                    "cannot resolve {}: {e}",
                    path.display()
                ))
            }
        })?;

        for prefix in &self.forbidden {
            if canonical.starts_with(prefix) {
                return Err(HandlerError::permission_denied(format!(
                    "path is forbidden: {}",
                    canonical.display()
                )));
            }
        }

        let allowed = self
            .allowed
            .iter()
            .any(|a| canonical.starts_with(&a.prefix) && (!write || a.writable));
        if !allowed {
            return Err(HandlerError::permission_denied(format!(
                "path is outside allowed prefixes: {}",
                canonical.display()
            )));
        }

        Ok(canonical)
    }
}

/// Resolve `..` and symlinks. For a path that does not exist yet, resolve
/// the parent and re-attach the final component so upload targets can be
/// vetted before creation.
fn canonicalize_target(path: &Path) -> io::Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(p) => Ok(p),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let parent = path
                .parent()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no parent"))?;
            let name = path
                .file_name()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no file name"))?;
            Ok(std::fs::canonicalize(parent)?.join(name))
        }
        Err(e) => Err(e),
    }
}

/// Command allow-list and argv vetting for `shell/exec`.
#[derive(Debug)]
pub struct CommandPolicy {
    allowed: Vec<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl CommandPolicy {
    /// An empty list means the documented defaults.
    pub fn new(allowed: Vec<String>) -> Self {
        let allowed = if allowed.is_empty() {
            DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect()
        } else {
            allowed
        };
        Self { allowed }
    }

    /// Split a command line into argv without shell interpretation and vet
    /// every element. The first token's basename must be allow-listed.
    pub fn parse(&self, command: &str) -> Result<Vec<String>, HandlerError> {
        let argv: Vec<String> = command.split_whitespace().map(String::from).collect();
        let Some(program) = argv.first() else {
            return Err(HandlerError::missing("command"));
        };

        for arg in &argv {
            if arg.contains(FORBIDDEN_CHARS) {
                return Err(HandlerError::invalid_params(format!(
                    "forbidden character in argument: {arg}"
                )));
            }
        }

        let base = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        if !self.allowed.iter().any(|a| a == base) {
            return Err(HandlerError::invalid_params(format!(
                "command not allowed: {base}"
            )));
        }

        Ok(argv)
    }
}

/// Token-bucket limits; `None` on the server config disables limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_minute: u32,
    pub max_concurrent: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 100,
            max_concurrent: 5,
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn admit(&mut self, now: Instant, span: Duration, limit: u32) -> bool {
        if now.duration_since(self.started) >= span {
            self.started = now;
            self.count = 0;
        }
        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Global request rate limiter. Admission takes the lock non-blocking; a
/// contended lock admits the request rather than stalling the channel.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<(Window, Window)>,
    in_flight: AtomicU32,
}

/// Releases the concurrency slot on drop.
#[derive(Debug)]
pub struct InFlight<'a> {
    limiter: &'a RateLimiter,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            windows: Mutex::new((
                Window {
                    started: now,
                    count: 0,
                },
                Window {
                    started: now,
                    count: 0,
                },
            )),
            in_flight: AtomicU32::new(0),
        }
    }

    /// Admit one request or fail with `ServiceUnavailable`.
    pub fn acquire(&self) -> Result<InFlight<'_>, HandlerError> {
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        if concurrent > self.config.max_concurrent {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(HandlerError::new(
                Code::ServiceUnavailable,
                "too many concurrent requests",
            ));
        }

        if let Ok(mut windows) = self.windows.try_lock() {
            let now = Instant::now();
            let (second, minute) = &mut *windows;
            let ok = second.admit(now, Duration::from_secs(1), self.config.per_second)
                && minute.admit(now, Duration::from_secs(60), self.config.per_minute);
            if !ok {
                drop(windows);
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(HandlerError::new(
                    Code::ServiceUnavailable,
                    "request rate limit exceeded",
                ));
            }
        }

        Ok(InFlight { limiter: self })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_rejected() {
        let policy = PathPolicy::default();
        let err = policy.check_read(Path::new("tmp/file")).unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
    }

    #[test]
    fn forbidden_prefixes_rejected() {
        let policy = PathPolicy::default();
        for p in ["/proc/self/environ", "/sys/kernel/x", "/root/secret", "/etc/shadow"] {
            let err = policy.check_read(Path::new(p)).unwrap_err();
            assert_eq!(err.code, Code::PermissionDenied, "path {p}");
        }
    }

    #[test]
    fn dotdot_escape_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let policy = PathPolicy::new(vec![AllowedPath::writable(&base)]);

        // resolves inside the sandbox
        let inside = base.join("sub/../file");
        std::fs::create_dir_all(base.join("sub")).unwrap();
        std::fs::write(base.join("file"), b"x").unwrap();
        assert!(policy.check_read(&inside).is_ok());

        // resolves outside of it
        let outside = base.join("../escape");
        let err = policy.check_write(&outside).unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
    }

    #[test]
    fn symlink_escape_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let sandbox = base.join("sandbox");
        let secret = base.join("secret");
        std::fs::create_dir_all(&sandbox).unwrap();
        std::fs::create_dir_all(&secret).unwrap();
        std::fs::write(secret.join("key"), b"k").unwrap();
        std::os::unix::fs::symlink(&secret, sandbox.join("link")).unwrap();

        let policy = PathPolicy::new(vec![AllowedPath::writable(&sandbox)]);
        let err = policy
            .check_read(&sandbox.join("link/key"))
            .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
    }

    #[test]
    fn missing_file_with_existing_parent_passes_write_check() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let policy = PathPolicy::new(vec![AllowedPath::writable(&base)]);

        let target = base.join("new-file.bin");
        let canonical = policy.check_write(&target).unwrap();
        assert_eq!(canonical, target);
    }

    #[test]
    fn missing_parent_is_file_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let policy = PathPolicy::new(vec![AllowedPath::writable(&base)]);

        let err = policy
            .check_write(&base.join("nope/new-file.bin"))
            .unwrap_err();
        assert_eq!(err.code, Code::FileNotFound);
    }

    #[test]
    fn read_only_prefix_rejects_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();
        let policy = PathPolicy::new(vec![AllowedPath::read_only(&base)]);

        let target = base.join("f");
        std::fs::write(&target, b"x").unwrap();
        assert!(policy.check_read(&target).is_ok());
        let err = policy.check_write(&target).unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
    }

    #[test]
    fn default_etc_is_read_only() {
        let policy = PathPolicy::default();
        assert!(policy.check_read(Path::new("/etc/hostname")).is_ok());
        let err = policy.check_write(Path::new("/etc/hostname")).unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
    }

    #[test]
    fn command_allow_list() {
        let policy = CommandPolicy::default();
        let argv = policy.parse("ls -la /tmp").unwrap();
        assert_eq!(argv, vec!["ls", "-la", "/tmp"]);

        let err = policy.parse("rm -rf /").unwrap_err();
        assert_eq!(err.code, Code::InvalidParams);
        assert!(err.detail.contains("command not allowed: rm"));
    }

    #[test]
    fn metacharacters_rejected() {
        let policy = CommandPolicy::default();
        for cmd in [
            "cat /tmp/x|grep y",
            "ls ;reboot",
            "cat $(whoami)",
            "ls >/tmp/out",
            "cat `id`",
            "grep & ls",
        ] {
            let err = policy.parse(cmd).unwrap_err();
            assert_eq!(err.code, Code::InvalidParams, "command {cmd:?}");
        }
    }

    #[test]
    fn basename_is_matched_not_full_path() {
        let policy = CommandPolicy::default();
        let argv = policy.parse("/usr/bin/ls /tmp").unwrap();
        assert_eq!(argv[0], "/usr/bin/ls");
    }

    #[test]
    fn empty_command_is_missing_required() {
        let policy = CommandPolicy::default();
        let err = policy.parse("   ").unwrap_err();
        assert_eq!(err.code, Code::MissingRequired);
    }

    #[test]
    fn rate_limit_per_second() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_second: 3,
            per_minute: 100,
            max_concurrent: 10,
        });
        for _ in 0..3 {
            limiter.acquire().unwrap();
        }
        let err = limiter.acquire().unwrap_err();
        assert_eq!(err.code, Code::ServiceUnavailable);
    }

    #[test]
    fn concurrency_cap_released_on_drop() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_second: 100,
            per_minute: 1000,
            max_concurrent: 1,
        });
        let guard = limiter.acquire().unwrap();
        assert!(limiter.acquire().is_err());
        drop(guard);
        assert!(limiter.acquire().is_ok());
    }
}

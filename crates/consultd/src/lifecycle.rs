//! Single-instance lifecycle: lock file, port election, lazy spawn.
//!
//! Exactly one daemon per user. The lock file under the state dir carries
//! the pid, chosen port, start time and the shared secret every client must
//! present. An unclean exit leaves a stale lock; the next start's liveness
//! check reclaims it.

use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DaemonError, Result};
use crate::paths::DaemonPaths;

pub const DEFAULT_PORT: u16 = 3456;
pub const PORT_PROBE_ATTEMPTS: u16 = 10;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const SPAWN_POLL_TIMEOUT: Duration = Duration::from_secs(3);
/// Substring looked for in a lock-holder's command line before trusting the
/// pid. Guards against pid reuse by unrelated processes.
pub const DAEMON_MARKER: &str = "consultd";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonLock {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub token: String,
}

/// Outcome of the single-instance election.
pub enum Election {
    /// A live daemon already holds the lock; its port is returned.
    AlreadyRunning(DaemonLock),
    /// We won; the chosen port is bound-probe-verified and any stale lock
    /// has been removed. The caller writes the lock once its state is up.
    Won { port: u16, token: String },
}

/// 256-bit random token as 64 hex chars.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn read_lock(paths: &DaemonPaths) -> Option<DaemonLock> {
    let raw = std::fs::read_to_string(paths.lock_file()).ok()?;
    serde_json::from_str(&raw).ok()
}

/// A lock is live when its pid exists and that process looks like one of
/// ours.
pub fn lock_is_live(lock: &DaemonLock) -> bool {
    pid_alive(lock.pid) && cmdline_matches(lock.pid)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) probes existence without signalling. EPERM still means
    // the pid exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

fn cmdline_matches(pid: u32) -> bool {
    if let Ok(raw) = std::fs::read(format!("/proc/{}/cmdline", pid)) {
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
        return cmdline.contains(DAEMON_MARKER);
    }
    // No procfs (macOS): fall back to ps.
    std::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "command="])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(DAEMON_MARKER))
        .unwrap_or(false)
}

/// Probe loopback ports starting at DEFAULT_PORT; first bindable wins.
pub fn select_port() -> Result<u16> {
    select_port_from(DEFAULT_PORT)
}

pub fn select_port_from(start: u16) -> Result<u16> {
    for offset in 0..PORT_PROBE_ATTEMPTS {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(_) => continue,
        }
    }
    Err(DaemonError::internal(format!(
        "no free loopback port in {}..{}",
        start,
        start.saturating_add(PORT_PROBE_ATTEMPTS)
    )))
}

/// Run the election. Does not write the winning lock; the daemon does that
/// after its port is final.
pub fn elect(paths: &DaemonPaths) -> Result<Election> {
    if let Some(lock) = read_lock(paths) {
        if lock_is_live(&lock) {
            info!("daemon already running (pid {}, port {})", lock.pid, lock.port);
            return Ok(Election::AlreadyRunning(lock));
        }
        warn!("removing stale lock (pid {} is gone)", lock.pid);
        let _ = std::fs::remove_file(paths.lock_file());
    } else if paths.lock_file().exists() {
        // Unparseable lock file: treat as stale.
        warn!("removing unreadable lock file");
        let _ = std::fs::remove_file(paths.lock_file());
    }

    let port = select_port()?;
    Ok(Election::Won {
        port,
        token: generate_token(),
    })
}

/// Write the lock atomically: temp file, owner-only mode, rename.
pub fn write_lock(paths: &DaemonPaths, lock: &DaemonLock) -> Result<()> {
    let body = serde_json::to_string_pretty(lock).map_err(anyhow::Error::new)?;
    let tmp = paths.lock_file().with_extension("lock.tmp");
    {
        let mut file = std::fs::File::create(&tmp).map_err(anyhow::Error::new)?;
        file.write_all(body.as_bytes()).map_err(anyhow::Error::new)?;
        file.sync_all().map_err(anyhow::Error::new)?;
    }
    set_owner_only(&tmp);
    std::fs::rename(&tmp, paths.lock_file()).map_err(anyhow::Error::new)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) {}

pub fn remove_lock(paths: &DaemonPaths) {
    let _ = std::fs::remove_file(paths.lock_file());
}

/// Removes the lock on drop so every clean exit path releases it.
pub struct LockGuard {
    paths: DaemonPaths,
}

impl LockGuard {
    pub fn new(paths: DaemonPaths) -> Self {
        Self { paths }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        remove_lock(&self.paths);
        info!("lock file removed");
    }
}

/// Client-side lazy spawn: make sure a daemon is running and return its
/// lock. Spawns a detached `--daemon` copy of this binary when no live lock
/// exists, then polls the lock file for up to three seconds.
pub async fn ensure_daemon_running(paths: &DaemonPaths) -> Result<DaemonLock> {
    if let Some(lock) = read_lock(paths) {
        if lock_is_live(&lock) {
            return Ok(lock);
        }
    }

    let exe = std::env::current_exe().map_err(anyhow::Error::new)?;
    info!("spawning daemon: {} --daemon", exe.display());
    std::process::Command::new(exe)
        .arg("--daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| DaemonError::internal(format!("failed to spawn daemon: {}", e)))?;

    let deadline = tokio::time::Instant::now() + SPAWN_POLL_TIMEOUT;
    loop {
        if let Some(lock) = read_lock(paths) {
            if lock_is_live(&lock) {
                return Ok(lock);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DaemonError::unavailable(
                "daemon did not come up within 3s",
            ));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths() -> (tempfile::TempDir, DaemonPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::at(dir.path()).unwrap();
        (dir, paths)
    }

    #[test]
    fn test_token_is_64_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_lock_write_read_round_trip() {
        let (_dir, paths) = test_paths();
        let lock = DaemonLock {
            pid: 4242,
            port: 3456,
            started_at: Utc::now(),
            token: generate_token(),
        };
        write_lock(&paths, &lock).unwrap();
        let read = read_lock(&paths).unwrap();
        assert_eq!(read.pid, 4242);
        assert_eq!(read.port, 3456);
        assert_eq!(read.token, lock.token);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(paths.lock_file()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let (_dir, paths) = test_paths();
        // A pid that cannot exist on Linux (beyond pid_max) is reliably dead.
        let stale = DaemonLock {
            pid: u32::MAX - 1,
            port: 3456,
            started_at: Utc::now(),
            token: generate_token(),
        };
        write_lock(&paths, &stale).unwrap();

        match elect(&paths).unwrap() {
            Election::Won { port, token } => {
                assert!(port >= DEFAULT_PORT);
                assert_eq!(token.len(), 64);
            }
            Election::AlreadyRunning(_) => panic!("stale lock should not win"),
        }
        assert!(!paths.lock_file().exists());
    }

    #[test]
    fn test_live_lock_wins_the_election() {
        let (_dir, paths) = test_paths();
        // Our own pid is alive and the test binary's name carries the
        // daemon marker, so this lock reads as live.
        let lock = DaemonLock {
            pid: std::process::id(),
            port: 4000,
            started_at: Utc::now(),
            token: generate_token(),
        };
        write_lock(&paths, &lock).unwrap();

        match elect(&paths).unwrap() {
            Election::AlreadyRunning(existing) => {
                assert_eq!(existing.port, 4000);
                assert_eq!(existing.token, lock.token);
            }
            Election::Won { .. } => panic!("live lock must not be reclaimed"),
        }
        assert!(paths.lock_file().exists());
    }

    #[test]
    fn test_unreadable_lock_is_reclaimed() {
        let (_dir, paths) = test_paths();
        std::fs::write(paths.lock_file(), b"not json").unwrap();
        assert!(matches!(elect(&paths).unwrap(), Election::Won { .. }));
    }

    #[test]
    fn test_port_probe_skips_bound_port() {
        // Bind an ephemeral port, then probe starting exactly there.
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let held = holder.local_addr().unwrap().port();
        let selected = select_port_from(held).unwrap();
        assert_ne!(selected, held);
        assert!(selected > held);
    }

    #[test]
    fn test_lock_guard_removes_file_on_drop() {
        let (_dir, paths) = test_paths();
        let lock = DaemonLock {
            pid: 1,
            port: 3456,
            started_at: Utc::now(),
            token: generate_token(),
        };
        write_lock(&paths, &lock).unwrap();
        {
            let _guard = LockGuard::new(paths.clone());
        }
        assert!(!paths.lock_file().exists());
    }
}

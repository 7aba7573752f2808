//! Process-level checks made before the daemon touches any device
//!
//! This module handles:
//! - Detecting whether we run with root privileges
//! - Refusing to start when another instance already owns the control nodes

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getuid, Pid};
use rgbkbd_common::tracing;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::DaemonError;

/// Whether the current process runs as root
pub fn is_root() -> bool {
    getuid().is_root()
}

/// Fail if the pid recorded at `pid_path` belongs to a live process other
/// than this one. A missing, unreadable or stale pid file is not an error.
pub fn check_singleton(pid_path: &Path) -> Result<(), DaemonError> {
    let contents = match fs::read_to_string(pid_path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!("No pid file at {}: {}", pid_path.display(), e);
            return Ok(());
        }
    };
    let Ok(pid) = contents.trim().parse::<i32>() else {
        warn!("Ignoring malformed pid file {}", pid_path.display());
        return Ok(());
    };
    if pid <= 0 || pid as u32 == std::process::id() {
        return Ok(());
    }
    match kill(Pid::from_raw(pid), None) {
        // EPERM means the process exists but belongs to someone else
        Ok(()) | Err(Errno::EPERM) => Err(DaemonError::AlreadyRunning { pid, path: pid_path.to_path_buf() }),
        Err(_) => {
            debug!("Stale pid {} in {}", pid, pid_path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn test_root_detection() {
        assert_eq!(is_root(), getuid().as_raw() == 0);
    }

    #[test]
    fn test_missing_or_garbage_pid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pid");
        assert!(check_singleton(&path).is_ok());
        fs::write(&path, "not a pid\n").unwrap();
        assert!(check_singleton(&path).is_ok());
    }

    #[test]
    fn test_own_pid_is_not_a_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pid");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(check_singleton(&path).is_ok());
    }

    #[test]
    fn test_live_and_stale_pids() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pid");
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        fs::write(&path, format!("{}\n", child.id())).unwrap();
        let result = check_singleton(&path);
        assert!(matches!(result, Err(DaemonError::AlreadyRunning { pid, .. }) if pid as u32 == child.id()));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(check_singleton(&path).is_ok());
    }
}

//! Per-device control directories.
//!
//! Each connected record gets `<devpath><slot>/` containing:
//! - `cmd`: a FIFO clients write newline-terminated commands into
//! - `model`, `serial`, `fwversion`, `features`: read-only descriptors
//! - `pid` (root only): the daemon's process id

use nix::sys::stat::Mode;
use nix::unistd::{chown, mkfifo, Gid};
use rgbkbd_common::tracing;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::device::DeviceRecord;

/// Partial lines longer than this are discarded
const MAX_PENDING: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum DevNodeError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to create FIFO {path}: {source}")]
    Fifo { path: PathBuf, source: nix::Error },
}

pub trait DevNode: Send + Sync {
    /// Expose the record and open its command FIFO. Sets `rec.node`.
    fn create(&self, rec: &mut DeviceRecord) -> Result<CommandFifo, DevNodeError>;
    /// Remove whatever `create` exposed and drop the FIFO
    fn remove(&self, rec: &mut DeviceRecord);
    /// Remove the node for `slot` without touching its record
    fn remove_slot(&self, slot: usize);
}

/// Non-blocking reader that yields complete command lines
pub struct CommandFifo {
    file: File,
    pending: Vec<u8>,
}

impl CommandFifo {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).custom_flags(libc::O_NONBLOCK).open(path)?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: File) -> Self {
        Self { file, pending: Vec::new() }
    }

    /// Every complete line available right now. A trailing partial line is
    /// kept for the next call.
    pub fn read_lines(&mut self) -> Vec<String> {
        let mut buf = [0u8; 4096];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Command FIFO read failed: {}", e);
                    break;
                }
            }
        }

        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            match std::str::from_utf8(&raw[..end]) {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                }
                Err(_) => warn!("Dropping command line that is not valid UTF-8"),
            }
        }
        if self.pending.len() > MAX_PENDING {
            warn!("Dropping {} bytes of unterminated command input", self.pending.len());
            self.pending.clear();
        }
        lines
    }
}

/// Control directories under a filesystem prefix such as `/dev/input/rgbkbd`
pub struct FsDevNode {
    prefix: PathBuf,
    gid: Option<u32>,
}

impl FsDevNode {
    pub fn new(prefix: impl Into<PathBuf>, gid: Option<u32>) -> Self {
        Self { prefix: prefix.into(), gid }
    }

    pub fn dir(&self, slot: usize) -> PathBuf {
        let mut name = self.prefix.clone().into_os_string();
        name.push(slot.to_string());
        PathBuf::from(name)
    }

    /// Where the root controller publishes the daemon pid
    pub fn pid_path(&self) -> PathBuf {
        self.dir(0).join("pid")
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<(), DevNodeError> {
        let io_err = |source| DevNodeError::Io { path: path.to_path_buf(), source };
        remove_stale(path)?;
        fs::write(path, contents).map_err(io_err)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o444)).map_err(io_err)?;
        self.chown(path);
        Ok(())
    }

    fn chown(&self, path: &Path) {
        if let Some(gid) = self.gid {
            if let Err(e) = chown(path, None, Some(Gid::from_raw(gid))) {
                warn!("Failed to set group {} on {}: {}", gid, path.display(), e);
            }
        }
    }

    fn make_fifo(&self, path: &Path) -> Result<(), DevNodeError> {
        remove_stale(path)?;
        let mode = if self.gid.is_some() { 0o660 } else { 0o600 };
        mkfifo(path, Mode::from_bits_truncate(mode)).map_err(|source| DevNodeError::Fifo { path: path.to_path_buf(), source })?;
        // mkfifo honours the umask
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|source| DevNodeError::Io { path: path.to_path_buf(), source })?;
        self.chown(path);
        Ok(())
    }
}

fn remove_stale(path: &Path) -> Result<(), DevNodeError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DevNodeError::Io { path: path.to_path_buf(), source }),
    }
}

impl DevNode for FsDevNode {
    fn create(&self, rec: &mut DeviceRecord) -> Result<CommandFifo, DevNodeError> {
        let dir = self.dir(rec.slot);
        let io_err = |source| DevNodeError::Io { path: dir.clone(), source };
        fs::create_dir_all(&dir).map_err(io_err)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).map_err(io_err)?;
        self.chown(&dir);
        rec.node = Some(dir.clone());

        if rec.is_root() {
            self.write_file(&dir.join("pid"), &format!("{}\n", std::process::id()))?;
        } else {
            self.write_file(&dir.join("model"), &format!("{}\n", rec.name))?;
            self.write_file(&dir.join("serial"), &format!("{}\n", rec.serial))?;
            self.write_file(&dir.join("fwversion"), &format!("{:04x}\n", rec.fw_version))?;
        }
        self.write_file(&dir.join("features"), &format!("{}\n", rec.features))?;

        let cmd = dir.join("cmd");
        self.make_fifo(&cmd)?;
        let fifo = CommandFifo::open(&cmd).map_err(|source| DevNodeError::Io { path: cmd.clone(), source })?;
        debug!("Created {}", dir.display());
        Ok(fifo)
    }

    fn remove(&self, rec: &mut DeviceRecord) {
        rec.fifo = None;
        if let Some(dir) = rec.node.take() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
    }

    fn remove_slot(&self, slot: usize) {
        let dir = self.dir(slot);
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!("Removed {}", dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
        }
    }
}

//! rgbkbd Daemon Library
//!
//! This library provides the core functionality for the rgbkbd daemon:
//! - A fixed table of device records and the tick loop that drives them
//! - Command ingestion from per-device FIFOs
//! - Hosting of lighting effects
//! - Forwarding key presses to a virtual keyboard
//! - USB, virtual input and device-node collaborators
//! - Bounded-time shutdown

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub mod animation;
pub mod command;
pub mod config;
pub mod device;
pub mod devnode;
pub mod injector;
pub mod keymap;
pub mod pacing;
pub mod scheduler;
pub mod security;
pub mod shutdown;
pub mod usb;

#[cfg(test)]
mod testutil;

pub use config::{Globals, Layout};
pub use device::{DeviceManager, DeviceRecord, DeviceTable, Features, UsbCommand};
pub use rgbkbd_common::EffectRegistry;

use devnode::DevNode;
use injector::{IndicatorSource, InputSink};
use usb::{UsbBackend, UsbError};

/// Services the core loop calls out to
#[derive(Clone)]
pub struct Collaborators {
    pub usb: Arc<dyn UsbBackend>,
    pub input: Arc<dyn InputSink>,
    pub indicators: Arc<dyn IndicatorSource>,
    pub nodes: Arc<dyn DevNode>,
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("rgbkbdd is already running (PID {pid}); if that is wrong, delete {path}")]
    AlreadyRunning { pid: i32, path: PathBuf },

    #[error("rgbkbdd must be run as root (use --nonroot to override)")]
    NotRoot,

    #[error("USB subsystem failed to start: {0}")]
    Usb(#[from] UsbError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("signal setup failed: {0}")]
    Signal(#[from] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

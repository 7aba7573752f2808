use clap::Parser;
use parking_lot::Mutex;
use rgbkbd_common::tracing;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::warn;

use crate::device::Features;
use crate::usb::DEFAULT_VENDORS;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rgbkbd/config.yaml";
pub const DEFAULT_FPS: u32 = 30;
pub const MAX_FPS: u32 = 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to parse {path}: {source}")]
    Yaml { path: PathBuf, source: serde_yaml::Error },
}

/// Where the configuration came from. `load_config` runs before logging is
/// up, so the caller reports this once the subscriber is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "loaded {}", path.display()),
            ConfigSource::Defaults(path) => write!(f, "{} not found, using defaults", path.display()),
        }
    }
}

/// Command line options; these override the configuration file
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rgbkbdd", version, about = "RGB keyboard driver daemon")]
pub struct Cli {
    /// Frame rate for animations and device polling (capped at 60)
    #[arg(long)]
    pub fps: Option<u32>,

    /// Default keyboard layout (us, gb, de, es, fr, se)
    #[arg(long)]
    pub layout: Option<String>,

    /// Group that owns the control directories
    #[arg(long)]
    pub gid: Option<u32>,

    /// Disable key rebinding (and with it notifications) on all devices
    #[arg(long)]
    pub nobind: bool,

    /// Disable indicator and key notifications on all devices
    #[arg(long)]
    pub nonotify: bool,

    /// Keep running without root privileges
    #[arg(long)]
    pub nonroot: bool,

    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// Daemon configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub scheduler: SchedulerSettings,
    pub devices: DeviceSettings,
    pub features: FeatureSettings,
}

/// Daemon-specific settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Control directories are `<devpath><slot>`
    pub devpath: String,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub fps: u32,
}

/// Device discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub gid: Option<u32>,
    /// Layout code; the locale decides when unset
    pub layout: Option<String>,
    pub vendors: Vec<u16>,
    pub hotplug_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub bind: bool,
    pub notify: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            devpath: "/dev/input/rgbkbd".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { fps: DEFAULT_FPS }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            gid: None,
            layout: None,
            vendors: DEFAULT_VENDORS.to_vec(),
            hotplug_interval_ms: 1000,
        }
    }
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self { bind: true, notify: true }
    }
}

/// Configuration manager for the rgbkbd daemon
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: DaemonConfig,
}

impl ConfigManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            config: DaemonConfig::default(),
        }
    }

    /// Load configuration from disk; a missing file leaves the defaults in place
    pub fn load_config(&mut self) -> Result<ConfigSource, ConfigError> {
        let path = &self.config_path;
        if !path.exists() {
            return Ok(ConfigSource::Defaults(path.clone()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        self.config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml { path: path.clone(), source })?;
        Ok(ConfigSource::File(path.clone()))
    }

    /// Fold command line overrides into the loaded configuration
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(fps) = cli.fps {
            self.config.scheduler.fps = fps;
        }
        if let Some(layout) = &cli.layout {
            self.config.devices.layout = Some(layout.clone());
        }
        if cli.gid.is_some() {
            self.config.devices.gid = cli.gid;
        }
        // --nobind implies --nonotify
        if cli.nobind {
            self.config.features.bind = false;
            self.config.features.notify = false;
        }
        if cli.nonotify {
            self.config.features.notify = false;
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn fps(&self) -> u32 {
        clamp_fps(self.config.scheduler.fps)
    }

    /// Features devices may enable
    pub fn features_mask(&self) -> Features {
        let mut mask = Features::ALL;
        mask.set(Features::BIND, self.config.features.bind);
        mask.set(Features::NOTIFY, self.config.features.notify);
        mask
    }

    /// Configured layout, else the one the locale implies
    pub fn layout(&self) -> Layout {
        if let Some(code) = &self.config.devices.layout {
            match Layout::from_code(code) {
                Some(layout) => return layout,
                None => warn!("Unknown layout '{}', falling back to locale", code),
            }
        }
        Layout::from_locale(&locale_from_env())
    }
}

/// Replace a frame rate outside 1..=60 with the cap
pub fn clamp_fps(fps: u32) -> u32 {
    if fps == 0 || fps > MAX_FPS {
        warn!("Requested {} FPS but capped at {}", fps, MAX_FPS);
        MAX_FPS
    } else {
        fps
    }
}

/// Keyboard layouts with distinct key positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    Us,
    #[default]
    Gb,
    De,
    Es,
    Fr,
    Se,
}

impl Layout {
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "us" => Some(Self::Us),
            "gb" | "uk" => Some(Self::Gb),
            "de" => Some(Self::De),
            "es" => Some(Self::Es),
            "fr" => Some(Self::Fr),
            "se" | "sv" => Some(Self::Se),
            _ => None,
        }
    }

    /// Guess from a locale name such as `de_DE.UTF-8`; anything unrecognised is `gb`
    pub fn from_locale(locale: &str) -> Self {
        let locale = locale.to_ascii_lowercase().replace('_', "-");
        const US: &[&str] = &["en-us", "en-au", "en-ca", "en-hk", "en-in", "en-nz", "en-ph", "en-sg", "en-za"];
        if locale.starts_with("de-") {
            Self::De
        } else if locale.starts_with("es-") {
            Self::Es
        } else if locale.starts_with("fr-") {
            Self::Fr
        } else if locale.starts_with("sv-") {
            Self::Se
        } else if US.iter().any(|prefix| locale.starts_with(prefix)) {
            Self::Us
        } else {
            Self::Gb
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Us => "us",
            Self::Gb => "gb",
            Self::De => "de",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::Se => "se",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Character-type locale in effect: `LC_ALL`, then `LC_CTYPE`, then `LANG`
pub fn locale_from_env() -> String {
    ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

/// Daemon-wide settings the root controller can change at runtime
#[derive(Debug)]
pub struct Globals {
    fps: AtomicU32,
    features: AtomicU32,
    layout: Mutex<Layout>,
}

impl Globals {
    pub fn new(fps: u32, features: Features, layout: Layout) -> Self {
        Self {
            fps: AtomicU32::new(clamp_fps(fps)),
            features: AtomicU32::new(features.bits()),
            layout: Mutex::new(layout),
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed)
    }

    /// Returns the rate actually applied
    pub fn set_fps(&self, fps: u32) -> u32 {
        let fps = clamp_fps(fps);
        self.fps.store(fps, Ordering::Relaxed);
        fps
    }

    pub fn features_mask(&self) -> Features {
        Features::from_bits(self.features.load(Ordering::Relaxed))
    }

    pub fn set_feature(&self, flag: Features, on: bool) {
        let mut mask = self.features_mask();
        mask.set(flag, on);
        self.features.store(mask.bits(), Ordering::Relaxed);
    }

    pub fn layout(&self) -> Layout {
        *self.layout.lock()
    }

    pub fn set_layout(&self, layout: Layout) {
        *self.layout.lock() = layout;
    }
}

impl Default for Globals {
    fn default() -> Self {
        Self::new(DEFAULT_FPS, Features::ALL, Layout::default())
    }
}

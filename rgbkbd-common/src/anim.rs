//! Effect plugin contract.
//!
//! An effect declares its metadata and parameters once through
//! [`Effect::info`], receives raw textual parameter values through
//! [`Effect::parameter`], and paints keys of a [`RunContext`] every frame.
//! The host owns the context; an effect only touches it during its own
//! callbacks.

use std::str::FromStr;
use thiserror::Error;

use crate::color::{ColorError, Gradient};

/// Errors produced while parsing a raw parameter value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("invalid number '{0}'")]
    InvalidDouble(String),

    #[error("invalid boolean '{0}'")]
    InvalidBool(String),

    #[error("invalid gradient: {0}")]
    InvalidGradient(#[from] ColorError),
}

/// A single key as seen by an effect: fixed position, mutable color
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Key {
    pub x: f64,
    pub y: f64,
    pub a: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Key {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, ..Self::default() }
    }

    pub fn clear(&mut self) {
        self.a = 0;
        self.r = 0;
        self.g = 0;
        self.b = 0;
    }
}

/// Per-attachment data surface handed to an effect
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub width: f64,
    pub height: f64,
    pub keys: Vec<Key>,
    /// Seconds since the previous frame
    pub elapsed: f64,
}

impl RunContext {
    pub fn new(width: f64, height: f64, positions: impl IntoIterator<Item = (f64, f64)>) -> Self {
        Self {
            width,
            height,
            keys: positions.into_iter().map(|(x, y)| Key::new(x, y)).collect(),
            elapsed: 0.0,
        }
    }

    /// Reset every key to transparent
    pub fn clear_keys(&mut self) {
        self.keys.iter_mut().for_each(Key::clear);
    }
}

/// Whether key colors survive from one frame to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPersistence {
    /// The effect clears its output at the start of every frame
    Clear,
    /// Colors accumulate across frames
    Keep,
}

/// How an effect's lifetime is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    /// One run lasts `duration` seconds; `frame` deltas are fractions of it
    Duration,
    /// Runs until stopped; `frame` deltas are seconds
    Indefinite,
}

/// Typed parameter kind with its default and bounds
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Gradient { default: Gradient },
    Double { default: f64, min: f64, max: f64 },
    Bool { default: bool },
}

/// Parsed parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Gradient(Gradient),
    Double(f64),
    Bool(bool),
}

impl ParamKind {
    /// Validate a raw value against this kind; doubles are clamped to bounds
    pub fn parse(&self, raw: &str) -> Result<ParamValue, ParamError> {
        match self {
            ParamKind::Gradient { .. } => Ok(ParamValue::Gradient(raw.parse()?)),
            ParamKind::Double { min, max, .. } => Ok(ParamValue::Double(parse_double(raw)?.clamp(*min, *max))),
            ParamKind::Bool { .. } => Ok(ParamValue::Bool(parse_bool(raw)?)),
        }
    }
}

/// Declared effect parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub prefix: &'static str,
    pub postfix: &'static str,
    pub kind: ParamKind,
}

impl ParamSpec {
    /// The default value in the same text form `parameter` receives
    pub fn default_raw(&self) -> String {
        match &self.kind {
            ParamKind::Gradient { default } => default.to_string(),
            ParamKind::Double { default, .. } => default.to_string(),
            ParamKind::Bool { default } => String::from(if *default { "1" } else { "0" }),
        }
    }
}

/// Named set of parameter values shipped with an effect
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub name: &'static str,
    pub params: Vec<(&'static str, &'static str)>,
}

/// Static effect metadata
#[derive(Debug, Clone, PartialEq)]
pub struct EffectInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub copyright: &'static str,
    pub license: &'static str,
    /// Stable globally unique identifier, braces included
    pub guid: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    pub persistence: KeyPersistence,
    pub time_mode: TimeMode,
    pub live_params: bool,
    pub repeat: bool,
    pub presets: Vec<Preset>,
}

impl EffectInfo {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// A lighting effect
pub trait Effect: Send {
    /// Static metadata; must return the same data on every call
    fn info(&self) -> &EffectInfo;

    /// Apply a raw parameter value. Unknown names and bad values are ignored.
    fn parameter(&mut self, name: &str, raw: &str);

    /// Begin or restart a run
    fn start(&mut self, ctx: &mut RunContext);

    /// Advance by `delta` and paint keys. Returns `false` once the run has
    /// naturally finished.
    fn frame(&mut self, ctx: &mut RunContext, delta: f64) -> bool;
}

/// Parse a floating point parameter
pub fn parse_double(raw: &str) -> Result<f64, ParamError> {
    let value = f64::from_str(raw.trim()).map_err(|_| ParamError::InvalidDouble(raw.to_string()))?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ParamError::InvalidDouble(raw.to_string()))
    }
}

/// Parse a boolean parameter: `0`/`1`, `true`/`false`, `on`/`off`
pub fn parse_bool(raw: &str) -> Result<bool, ParamError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ParamError::InvalidBool(raw.to_string())),
    }
}

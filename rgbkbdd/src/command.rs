//! Control commands read from a record's FIFO.
//!
//! One command per line, words separated by whitespace. Device commands:
//! - `rgb on|off`, `rgb <all|i,j,...>:<rrggbb>`
//! - `effect <name|guid|none>`, `start`, `stop`
//! - `param <name> <value...>`, `preset <name>`
//! - `notify on|off`, `bind on|off`
//!
//! The root controller also accepts `fps <n>`, `layout <code>` and
//! `feature notify|bind on|off`.

use rgbkbd_common::{tracing, Argb, EffectRegistry};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::animation::Animation;
use crate::config::{Globals, Layout};
use crate::device::{DeviceRecord, Features, UsbCommand};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("'{0}' needs {1}")]
    Missing(&'static str, &'static str),

    #[error("invalid {what} '{value}'")]
    Invalid { what: &'static str, value: String },
}

/// Keys addressed by an `rgb` color command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    All,
    Indices(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Rgb(bool),
    RgbSet { keys: KeySelection, color: Argb },
    Effect(Option<String>),
    Start,
    Stop,
    Param { name: String, value: String },
    Preset(String),
    Notify(bool),
    Bind(bool),
    Fps(u32),
    Layout(String),
    Feature { flag: Features, on: bool },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        match word.to_ascii_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            "rgb" => parse_rgb(rest),
            "effect" => match rest {
                "" => Err(CommandError::Missing("effect", "a name")),
                none if none.eq_ignore_ascii_case("none") => Ok(Self::Effect(None)),
                id => Ok(Self::Effect(Some(id.to_string()))),
            },
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "param" => {
                let (name, value) = rest.split_once(char::is_whitespace).ok_or(CommandError::Missing("param", "a name and value"))?;
                Ok(Self::Param { name: name.to_string(), value: value.trim().to_string() })
            }
            "preset" if !rest.is_empty() => Ok(Self::Preset(rest.to_string())),
            "preset" => Err(CommandError::Missing("preset", "a name")),
            "notify" => Ok(Self::Notify(parse_switch(rest)?)),
            "bind" => Ok(Self::Bind(parse_switch(rest)?)),
            "fps" => rest
                .parse()
                .map(Self::Fps)
                .map_err(|_| CommandError::Invalid { what: "frame rate", value: rest.to_string() }),
            "layout" if !rest.is_empty() => Ok(Self::Layout(rest.to_string())),
            "layout" => Err(CommandError::Missing("layout", "a layout code")),
            "feature" => {
                let (name, switch) = rest.split_once(char::is_whitespace).ok_or(CommandError::Missing("feature", "a name and on/off"))?;
                let flag = match name.to_ascii_lowercase().as_str() {
                    "notify" => Features::NOTIFY,
                    "bind" => Features::BIND,
                    _ => return Err(CommandError::Invalid { what: "feature", value: name.to_string() }),
                };
                Ok(Self::Feature { flag, on: parse_switch(switch.trim())? })
            }
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    /// Commands only the root controller may issue
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Fps(_) | Self::Layout(_) | Self::Feature { .. })
    }
}

fn parse_switch(word: &str) -> Result<bool, CommandError> {
    match word.to_ascii_lowercase().as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(CommandError::Invalid { what: "switch", value: word.to_string() }),
    }
}

fn parse_rgb(rest: &str) -> Result<Command, CommandError> {
    match rest.to_ascii_lowercase().as_str() {
        "" => Err(CommandError::Missing("rgb", "on, off or key:color")),
        "on" => Ok(Command::Rgb(true)),
        "off" => Ok(Command::Rgb(false)),
        _ => {
            let (keys, color) = rest
                .split_once(':')
                .ok_or_else(|| CommandError::Invalid { what: "rgb argument", value: rest.to_string() })?;
            let invalid_color = || CommandError::Invalid { what: "color", value: color.to_string() };
            if color.len() != 6 || !color.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid_color());
            }
            let rgb = u32::from_str_radix(color, 16).map_err(|_| invalid_color())?;
            let color = Argb::opaque((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8);
            let keys = if keys.eq_ignore_ascii_case("all") {
                KeySelection::All
            } else {
                let indices = keys
                    .split(',')
                    .map(|k| k.trim().parse::<usize>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| CommandError::Invalid { what: "key list", value: keys.to_string() })?;
                KeySelection::Indices(indices)
            };
            Ok(Command::RgbSet { keys, color })
        }
    }
}

/// Applies commands to the record they were written to
pub struct Dispatcher {
    registry: EffectRegistry,
}

impl Dispatcher {
    pub fn new(registry: EffectRegistry) -> Self {
        Self { registry }
    }

    /// Parse and apply one command line. Malformed lines are logged and dropped.
    pub fn run(&self, rec: &mut DeviceRecord, line: &str, globals: &Globals, now: Instant) {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring '{}' on slot {}: {}", line, rec.slot, e);
                return;
            }
        };
        if command.is_admin() && !rec.is_root() {
            warn!("Ignoring '{}' on slot {}: only the root controller accepts it", line, rec.slot);
            return;
        }
        debug!("Slot {}: {:?}", rec.slot, command);
        self.apply(rec, command, globals, now);
    }

    /// Read and apply every complete line waiting in the record's FIFO
    pub fn poll_fifo(&self, rec: &mut DeviceRecord, globals: &Globals, now: Instant) -> usize {
        let Some(fifo) = rec.fifo.as_mut() else {
            return 0;
        };
        let lines = fifo.read_lines();
        for line in &lines {
            self.run(rec, line, globals, now);
        }
        lines.len()
    }

    fn apply(&self, rec: &mut DeviceRecord, command: Command, globals: &Globals, now: Instant) {
        match command {
            Command::Rgb(on) => {
                rec.lighting.enabled = on;
                push_frame(rec);
            }
            Command::RgbSet { keys, color } => {
                let base = &mut rec.lighting.base;
                match keys {
                    KeySelection::All => base.iter_mut().for_each(|c| *c = color),
                    KeySelection::Indices(indices) => {
                        for i in indices {
                            match base.get_mut(i) {
                                Some(c) => *c = color,
                                None => debug!("Slot {}: no key {}", rec.slot, i),
                            }
                        }
                    }
                }
                push_frame(rec);
            }
            Command::Effect(Some(id)) => match self.registry.create(&id) {
                Some(effect) => {
                    let animation = Animation::new(effect, &rec.geometry);
                    info!("Slot {}: effect {} {}", rec.slot, animation.info().name, animation.info().version);
                    rec.animation = Some(animation);
                }
                None => warn!("Slot {}: unknown effect '{}', known: {:?}", rec.slot, id, self.registry.names()),
            },
            Command::Effect(None) => {
                rec.animation = None;
                push_frame(rec);
            }
            Command::Start => match rec.animation.as_mut() {
                Some(animation) => animation.start(now),
                None => warn!("Slot {}: no effect to start", rec.slot),
            },
            Command::Stop => {
                if let Some(animation) = rec.animation.as_mut() {
                    animation.stop();
                }
                push_frame(rec);
            }
            Command::Param { name, value } => match rec.animation.as_mut() {
                Some(animation) => animation.set_param(&name, &value),
                None => warn!("Slot {}: no effect for parameter {}", rec.slot, name),
            },
            Command::Preset(name) => match rec.animation.as_mut() {
                Some(animation) => {
                    if !animation.apply_preset(&name) {
                        warn!("Slot {}: {} has no preset '{}'", rec.slot, animation.info().name, name);
                    }
                }
                None => warn!("Slot {}: no effect for preset {}", rec.slot, name),
            },
            Command::Notify(on) => set_feature(rec, Features::NOTIFY, on, globals),
            Command::Bind(on) => set_feature(rec, Features::BIND, on, globals),
            Command::Fps(fps) => {
                let fps = globals.set_fps(fps);
                info!("Frame rate set to {}", fps);
            }
            Command::Layout(code) => match Layout::from_code(&code) {
                Some(layout) => {
                    globals.set_layout(layout);
                    info!("Default layout set to {}", layout);
                }
                None => warn!("Unknown layout '{}'", code),
            },
            Command::Feature { flag, on } => {
                globals.set_feature(flag, on);
                info!("Feature {} {}", flag, if on { "enabled" } else { "disabled" });
            }
        }
    }
}

/// Queue the static lighting, composited under the animation if one is running
fn push_frame(rec: &mut DeviceRecord) {
    if rec.is_root() {
        return;
    }
    let keys = rec.animation.as_ref().filter(|a| a.is_running()).map(|a| a.keys());
    let colors = rec.lighting.frame(keys);
    rec.enqueue(UsbCommand::Colors(colors));
}

fn set_feature(rec: &mut DeviceRecord, flag: Features, on: bool, globals: &Globals) {
    let allowed = globals.features_mask().contains(flag);
    if on && !allowed {
        warn!("Slot {}: feature {} is disabled daemon-wide", rec.slot, flag);
    }
    rec.features.set(flag, on && allowed);
}

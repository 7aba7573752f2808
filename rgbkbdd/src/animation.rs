//! Effect host.
//!
//! Wraps one [`Effect`] instance with the state the daemon keeps around it:
//! - the key context built from the device geometry
//! - the run duration (a host-level `duration` parameter)
//! - parameter updates held back while a non-live effect runs
//! - frame timing

use rgbkbd_common::anim::parse_double;
use rgbkbd_common::{tracing, Effect, EffectInfo, Key, RunContext, TimeMode};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::device::Geometry;

/// Run length used until a `duration` parameter says otherwise
pub const DEFAULT_DURATION: f64 = 1.0;

pub struct Animation {
    effect: Box<dyn Effect>,
    ctx: RunContext,
    /// Seconds per run, only meaningful for duration-based effects
    duration: f64,
    running: bool,
    pending: Vec<(String, String)>,
    last_frame: Option<Instant>,
}

impl Animation {
    /// Attach an effect to a geometry and seed every declared parameter default
    pub fn new(mut effect: Box<dyn Effect>, geometry: &Geometry) -> Self {
        let defaults: Vec<(&'static str, String)> =
            effect.info().params.iter().map(|p| (p.name, p.default_raw())).collect();
        for (name, raw) in defaults {
            effect.parameter(name, &raw);
        }
        Self {
            effect,
            ctx: RunContext::new(geometry.width, geometry.height, geometry.positions.iter().copied()),
            duration: DEFAULT_DURATION,
            running: false,
            pending: Vec::new(),
            last_frame: None,
        }
    }

    pub fn info(&self) -> &EffectInfo {
        self.effect.info()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn keys(&self) -> &[Key] {
        &self.ctx.keys
    }

    /// Apply a parameter now, or hold it until the next start if the effect
    /// does not take live updates
    pub fn set_param(&mut self, name: &str, raw: &str) {
        if name == "duration" {
            match parse_double(raw) {
                Ok(secs) if secs > 0.0 => self.duration = secs,
                _ => debug!("{}: ignoring duration '{}'", self.info().name, raw),
            }
            return;
        }
        if self.running && !self.info().live_params {
            self.pending.push((name.to_string(), raw.to_string()));
        } else {
            self.effect.parameter(name, raw);
        }
    }

    /// Apply every value of a named preset; false if the effect has no such preset
    pub fn apply_preset(&mut self, name: &str) -> bool {
        let Some(preset) = self.info().preset(name) else {
            return false;
        };
        let params: Vec<(&'static str, &'static str)> = preset.params.clone();
        for (param, raw) in params {
            self.set_param(param, raw);
        }
        true
    }

    pub fn start(&mut self, now: Instant) {
        for (name, raw) in std::mem::take(&mut self.pending) {
            self.effect.parameter(&name, &raw);
        }
        self.ctx.clear_keys();
        self.ctx.elapsed = 0.0;
        self.effect.start(&mut self.ctx);
        self.running = true;
        self.last_frame = Some(now);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.last_frame = None;
        self.ctx.clear_keys();
    }

    /// Whether a frame is owed at `fps` frames per second
    pub fn due(&self, now: Instant, fps: u32) -> bool {
        let interval = Duration::from_secs(1) / fps.max(1);
        self.running && self.last_frame.map_or(true, |last| now.saturating_duration_since(last) >= interval)
    }

    /// Advance to `now` and return the painted keys, or `None` when stopped.
    /// A duration-based effect that finishes stops, or restarts if it repeats.
    pub fn render(&mut self, now: Instant) -> Option<&[Key]> {
        if !self.running {
            return None;
        }
        let elapsed = self.last_frame.map_or(0.0, |last| now.saturating_duration_since(last).as_secs_f64());
        self.last_frame = Some(now);
        self.ctx.elapsed = elapsed;

        let time_mode = self.info().time_mode;
        let delta = match time_mode {
            TimeMode::Duration => elapsed / self.duration,
            TimeMode::Indefinite => elapsed,
        };
        let more = self.effect.frame(&mut self.ctx, delta);
        if !more && time_mode == TimeMode::Duration {
            if self.info().repeat {
                self.effect.start(&mut self.ctx);
            } else {
                debug!("{} finished", self.info().name);
                self.running = false;
            }
        }
        Some(self.ctx.keys.as_slice())
    }
}

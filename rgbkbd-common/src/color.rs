//! Color primitives and the gradient model every effect samples from.
//!
//! A [`Gradient`] is a short list of color stops placed on a 0-100 scale.
//! Stops are few (a dozen at most in practice), so lookups are a linear scan.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::anim::Key;

/// Errors produced while parsing colors and gradients from text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ColorError {
    #[error("invalid color '{0}': expected rrggbb or aarrggbb hex")]
    InvalidColor(String),

    #[error("invalid gradient stop '{0}': expected pos:aarrggbb")]
    InvalidStop(String),

    #[error("gradient stop position {0} is outside 0..=100")]
    PositionOutOfRange(u32),

    #[error("gradient stop at {position} comes before the previous stop at {previous}")]
    OutOfOrder { position: u8, previous: u8 },
}

/// 8-bit ARGB color
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Argb {
    pub a: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Argb {
    pub const TRANSPARENT: Self = Self { a: 0, r: 0, g: 0, b: 0 };

    pub const fn new(a: u8, r: u8, g: u8, b: u8) -> Self {
        Self { a, r, g, b }
    }

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { a: 255, r, g, b }
    }

    pub fn to_f(self) -> ColorF {
        ColorF {
            a: f64::from(self.a),
            r: f64::from(self.r),
            g: f64::from(self.g),
            b: f64::from(self.b),
        }
    }
}

impl FromStr for Argb {
    type Err = ColorError;

    /// Parse `rrggbb` (opaque) or `aarrggbb`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim();
        let invalid = || ColorError::InvalidColor(s.to_string());
        if !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
        match hex.len() {
            6 => Ok(Self::opaque(byte(0)?, byte(2)?, byte(4)?)),
            8 => Ok(Self::new(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Argb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}{:02x}", self.a, self.r, self.g, self.b)
    }
}

/// Floating point color with every channel in 0.0..=255.0
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ColorF {
    pub a: f64,
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl ColorF {
    pub fn lerp(from: ColorF, to: ColorF, t: f64) -> ColorF {
        let mix = |x: f64, y: f64| x + (y - x) * t;
        ColorF {
            a: mix(from.a, to.a),
            r: mix(from.r, to.r),
            g: mix(from.g, to.g),
            b: mix(from.b, to.b),
        }
    }
}

/// One color stop of a gradient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stop {
    pub position: u8,
    pub color: Argb,
}

/// Ordered color stops on a 0-100 scale
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gradient {
    stops: Vec<Stop>,
}

impl Gradient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gradient holding one color along its whole length
    pub fn solid(color: Argb) -> Self {
        Self {
            stops: vec![
                Stop { position: 0, color },
                Stop { position: 100, color },
            ],
        }
    }

    /// Fade from `color` at 0 to the same color fully transparent at 100
    pub fn fade(color: Argb) -> Self {
        Self {
            stops: vec![
                Stop { position: 0, color },
                Stop { position: 100, color: Argb { a: 0, ..color } },
            ],
        }
    }

    /// Append a stop. Positions must not decrease.
    pub fn push(&mut self, position: u8, color: Argb) -> Result<(), ColorError> {
        if position > 100 {
            return Err(ColorError::PositionOutOfRange(u32::from(position)));
        }
        if let Some(last) = self.stops.last() {
            if position < last.position {
                return Err(ColorError::OutOfOrder { position, previous: last.position });
            }
        }
        self.stops.push(Stop { position, color });
        Ok(())
    }

    pub fn stops(&self) -> &[Stop] {
        &self.stops
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Interpolated color at `position` (0-100).
    ///
    /// Positions outside the stop range clamp to the nearest end stop. An
    /// empty gradient yields transparent black.
    pub fn query(&self, position: f64) -> ColorF {
        let (first, last) = match (self.stops.first(), self.stops.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return ColorF::default(),
        };
        if position <= f64::from(first.position) {
            return first.color.to_f();
        }
        if position >= f64::from(last.position) {
            return last.color.to_f();
        }

        for pair in self.stops.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            let lo = f64::from(lower.position);
            let hi = f64::from(upper.position);
            if position == lo {
                return lower.color.to_f();
            }
            if position > lo && position < hi {
                let t = (position - lo) / (hi - lo);
                return ColorF::lerp(lower.color.to_f(), upper.color.to_f(), t);
            }
        }
        last.color.to_f()
    }
}

impl FromStr for Gradient {
    type Err = ColorError;

    /// Either `pos:aarrggbb` stops separated by whitespace, or a bare color
    /// which becomes a fade to transparent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::new());
        }
        if !s.contains(':') {
            return Ok(Self::fade(s.parse()?));
        }

        let mut gradient = Self::new();
        for token in s.split_whitespace() {
            let (pos, color) = token
                .split_once(':')
                .ok_or_else(|| ColorError::InvalidStop(token.to_string()))?;
            let pos: u32 = pos.parse().map_err(|_| ColorError::InvalidStop(token.to_string()))?;
            let pos = u8::try_from(pos).map_err(|_| ColorError::PositionOutOfRange(pos))?;
            gradient.push(pos, color.parse()?)?;
        }
        Ok(gradient)
    }
}

impl fmt::Display for Gradient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, stop) in self.stops.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", stop.position, stop.color)?;
        }
        Ok(())
    }
}

/// Composite `color` over the key's current color ("over" operator,
/// non-premultiplied).
pub fn alpha_blend(key: &mut Key, color: ColorF) {
    let a = (color.a / 255.0).clamp(0.0, 1.0);
    let ka = f64::from(key.a) / 255.0;
    let out_a = a + ka * (1.0 - a);
    if out_a <= 0.0 {
        key.a = 0;
        key.r = 0;
        key.g = 0;
        key.b = 0;
        return;
    }
    let mix = |c: f64, kc: u8| to_channel((c * a + f64::from(kc) * ka * (1.0 - a)) / out_a);
    key.r = mix(color.r, key.r);
    key.g = mix(color.g, key.g);
    key.b = mix(color.b, key.b);
    key.a = to_channel(out_a * 255.0);
}

/// Map any angle into `[0, 2π)`
pub fn normalize_angle(theta: f64) -> f64 {
    let tau = PI * 2.0;
    let wrapped = theta.rem_euclid(tau);
    // rem_euclid can round up to exactly tau for tiny negative inputs
    if wrapped >= tau {
        0.0
    } else {
        wrapped
    }
}

fn to_channel(v: f64) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

use std::f64::consts::PI;

use crate::anim::{
    Effect, EffectInfo, KeyPersistence, ParamKind, ParamSpec, ParamValue, Preset, RunContext, TimeMode,
};
use crate::color::{alpha_blend, normalize_angle, Argb, Gradient};
use crate::tracing::debug;

/// A wheel spoke sweeping around the keyboard center once per duration
pub struct Pinwheel {
    info: EffectInfo,
    color: Gradient,
    /// Spoke length in radians
    length: f64,
    symmetric: bool,
    /// Position within the current turn, negative until started
    frame: f64,
    center: (f64, f64),
}

impl Pinwheel {
    pub const GUID: &'static str = "{07551A90-D97A-4DD0-A770-E9E280A90891}";

    pub fn new() -> Self {
        let info = EffectInfo {
            name: "Pinwheel",
            version: "0.8",
            copyright: "2014-2015",
            license: "GPLv2",
            guid: Self::GUID,
            description: "A spinning pinwheel effect.",
            params: vec![
                ParamSpec {
                    name: "color",
                    prefix: "Wheel color:",
                    postfix: "",
                    kind: ParamKind::Gradient { default: Gradient::fade(Argb::opaque(255, 255, 255)) },
                },
                ParamSpec {
                    name: "length",
                    prefix: "Wheel size:",
                    postfix: "%",
                    kind: ParamKind::Double { default: 100.0, min: 1.0, max: 100.0 },
                },
                ParamSpec {
                    name: "symmetric",
                    prefix: "Symmetric",
                    postfix: "",
                    kind: ParamKind::Bool { default: false },
                },
            ],
            persistence: KeyPersistence::Clear,
            time_mode: TimeMode::Duration,
            live_params: true,
            repeat: false,
            presets: vec![
                Preset {
                    name: "Search light",
                    params: vec![("duration", "2.0"), ("length", "50.0"), ("symmetric", "1")],
                },
                Preset {
                    name: "Rainbow",
                    params: vec![
                        ("color", "0:ffff0000 17:ffffff00 33:ff00ff00 50:ff00ffff 67:ff0000ff 83:ffff00ff 100:ffff0000"),
                        ("duration", "2.0"),
                    ],
                },
            ],
        };
        Self {
            info,
            color: Gradient::fade(Argb::opaque(255, 255, 255)),
            length: PI * 2.0,
            symmetric: false,
            frame: -1.0,
            center: (0.0, 0.0),
        }
    }
}

impl Default for Pinwheel {
    fn default() -> Self {
        Self::new()
    }
}

impl Effect for Pinwheel {
    fn info(&self) -> &EffectInfo {
        &self.info
    }

    fn parameter(&mut self, name: &str, raw: &str) {
        let Some(spec) = self.info.param(name) else {
            return;
        };
        match spec.kind.parse(raw) {
            Ok(ParamValue::Gradient(gradient)) => self.color = gradient,
            Ok(ParamValue::Double(len)) => self.length = len / 100.0 * PI * 2.0,
            Ok(ParamValue::Bool(symmetric)) => self.symmetric = symmetric,
            Err(e) => debug!("pinwheel: ignoring {}={}: {}", name, raw, e),
        }
    }

    fn start(&mut self, ctx: &mut RunContext) {
        self.frame = 0.0;
        self.center = (ctx.width / 2.0, ctx.height / 2.0);
    }

    fn frame(&mut self, ctx: &mut RunContext, delta: f64) -> bool {
        if self.frame < 0.0 {
            self.start(ctx);
        }
        ctx.clear_keys();
        self.frame += delta;
        if self.frame > 1.0 {
            self.frame -= self.frame.floor();
        }

        let position = normalize_angle(-self.frame * PI * 2.0);
        let (cx, cy) = self.center;
        for key in ctx.keys.iter_mut() {
            let mut theta = if key.x == cx && key.y == cy {
                0.0
            } else {
                normalize_angle(normalize_angle((cx - key.x).atan2(cy - key.y)) - position)
            };
            if self.symmetric && theta > PI {
                theta = PI * 2.0 - theta;
            }
            if theta < self.length {
                let distance = theta / self.length;
                alpha_blend(key, self.color.query(distance * 100.0));
            }
        }
        true
    }
}

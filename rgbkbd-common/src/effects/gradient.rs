use crate::anim::{Effect, EffectInfo, KeyPersistence, ParamKind, ParamSpec, ParamValue, Preset, RunContext, TimeMode};
use crate::color::{alpha_blend, Argb, Gradient};
use crate::tracing::debug;

/// Whole-keyboard fade through a gradient, once per run
pub struct GradientFade {
    info: EffectInfo,
    color: Gradient,
    progress: f64,
}

impl GradientFade {
    pub const GUID: &'static str = "{54DD2975-E192-457D-BCFC-D912A24E33B4}";

    pub fn new() -> Self {
        let default = Gradient::fade(Argb::opaque(255, 255, 255));
        let info = EffectInfo {
            name: "Gradient",
            version: "0.9",
            copyright: "2014-2015",
            license: "GPLv2",
            guid: Self::GUID,
            description: "A transition from one color to another.",
            params: vec![ParamSpec {
                name: "color",
                prefix: "Color:",
                postfix: "",
                kind: ParamKind::Gradient { default: default.clone() },
            }],
            persistence: KeyPersistence::Clear,
            time_mode: TimeMode::Duration,
            live_params: false,
            repeat: false,
            presets: vec![Preset {
                name: "Flash",
                params: vec![("color", "0:ffffffff 100:00ffffff"), ("duration", "0.5")],
            }],
        };
        Self { info, color: default, progress: 0.0 }
    }
}

impl Default for GradientFade {
    fn default() -> Self {
        Self::new()
    }
}

impl Effect for GradientFade {
    fn info(&self) -> &EffectInfo {
        &self.info
    }

    fn parameter(&mut self, name: &str, raw: &str) {
        let Some(spec) = self.info.param(name) else {
            return;
        };
        match spec.kind.parse(raw) {
            Ok(ParamValue::Gradient(gradient)) => self.color = gradient,
            Ok(_) => {}
            Err(e) => debug!("gradient: ignoring {}={}: {}", name, raw, e),
        }
    }

    fn start(&mut self, _ctx: &mut RunContext) {
        self.progress = 0.0;
    }

    fn frame(&mut self, ctx: &mut RunContext, delta: f64) -> bool {
        ctx.clear_keys();
        self.progress = (self.progress + delta).min(1.0);
        let color = self.color.query(self.progress * 100.0);
        for key in ctx.keys.iter_mut() {
            alpha_blend(key, color);
        }
        self.progress < 1.0
    }
}

//! Shared types for rgbkbd: the color model and the effect plugin contract.

// Re-export common dependencies
pub use tracing;

pub mod anim;
pub mod color;
pub mod effects;

pub use anim::{Effect, EffectInfo, Key, KeyPersistence, ParamKind, ParamSpec, Preset, RunContext, TimeMode};
pub use color::{alpha_blend, normalize_angle, Argb, ColorF, Gradient};
pub use effects::EffectRegistry;

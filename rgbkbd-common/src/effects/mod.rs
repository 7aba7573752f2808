//! Built-in effects and the registry that maps identifiers to them

mod gradient;
mod pinwheel;

pub use gradient::GradientFade;
pub use pinwheel::Pinwheel;

use crate::anim::Effect;

/// Constructor for a fresh effect instance
pub type EffectCtor = fn() -> Box<dyn Effect>;

struct Entry {
    guid: &'static str,
    name: &'static str,
    ctor: EffectCtor,
}

/// Lookup table from effect GUID or name to its constructor
pub struct EffectRegistry {
    entries: Vec<Entry>,
}

impl EffectRegistry {
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registry holding every effect shipped with this crate
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(|| -> Box<dyn Effect> { Box::new(Pinwheel::new()) });
        registry.register(|| -> Box<dyn Effect> { Box::new(GradientFade::new()) });
        registry
    }

    /// Register an effect under the GUID and name it declares.
    /// A later registration with the same GUID replaces the earlier one.
    pub fn register(&mut self, ctor: EffectCtor) {
        let probe = ctor();
        let info = probe.info();
        let entry = Entry { guid: info.guid, name: info.name, ctor };
        match self.entries.iter_mut().find(|e| e.guid == entry.guid) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Instantiate by GUID (exact) or name (case-insensitive)
    pub fn create(&self, id: &str) -> Option<Box<dyn Effect>> {
        let id = id.trim();
        self.entries
            .iter()
            .find(|e| e.guid.eq_ignore_ascii_case(id) || e.name.eq_ignore_ascii_case(id))
            .map(|e| (e.ctor)())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

//! Pluggable per-tick observers.
//!
//! Modules run after the planner slot. They see the previous committed
//! snapshot and keep their own state, which is persisted as an extension
//! section of every snapshot under the module's name.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;

use crate::fixed::Ticks;
use crate::snapshot::TickSnapshot;

// ---------------------------------------------------------------------------
// Module trait
// ---------------------------------------------------------------------------

pub trait Module: Debug + Send {
    /// Unique among the modules of one world; used as the extension key.
    fn name(&self) -> &str;

    fn on_tick(&mut self, ctx: &ModuleContext<'_>) {
        let _ = ctx;
    }

    /// State to persist. Empty for stateless modules.
    fn serialize_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn load_state(&mut self, _data: &[u8]) -> Result<(), ModuleError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// What a module sees during its tick.
pub struct ModuleContext<'a> {
    /// The tick being computed.
    pub tick: Ticks,
    /// The last committed snapshot (tick - 1).
    pub snapshot: &'a TickSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleError {
    #[error("deserialize failed: {0}")]
    DeserializeFailed(String),
    #[error("module not found: {0}")]
    NotFound(String),
    #[error("module already registered: {0}")]
    Duplicate(String),
}

// ---------------------------------------------------------------------------
// ModuleHost
// ---------------------------------------------------------------------------

/// Registered modules, in registration order.
#[derive(Debug, Default)]
pub struct ModuleHost {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Box<dyn Module>) -> Result<(), ModuleError> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(ModuleError::Duplicate(module.name().to_string()));
        }
        self.modules.push(module);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.name())
    }

    /// Find a module by concrete type.
    pub fn get<T: Module + 'static>(&self) -> Option<&T> {
        self.modules.iter().find_map(|m| m.as_any().downcast_ref())
    }

    pub fn get_mut<T: Module + 'static>(&mut self) -> Option<&mut T> {
        self.modules
            .iter_mut()
            .find_map(|m| m.as_any_mut().downcast_mut())
    }

    pub fn run(&mut self, ctx: &ModuleContext<'_>) {
        for module in &mut self.modules {
            let _span = tracing::trace_span!("module", name = module.name()).entered();
            module.on_tick(ctx);
        }
    }

    /// Every module's persisted state, keyed by name.
    pub fn save_states(&self) -> BTreeMap<String, Vec<u8>> {
        self.modules
            .iter()
            .map(|m| (m.name().to_string(), m.serialize_state()))
            .collect()
    }

    /// Load state for every module that has an entry. Entries without a
    /// registered module are ignored; modules without an entry load an
    /// empty buffer.
    pub fn load_states(&mut self, states: &BTreeMap<String, Vec<u8>>) -> Result<(), ModuleError> {
        for module in &mut self.modules {
            let data = states.get(module.name()).map(Vec::as_slice).unwrap_or(&[]);
            module.load_state(data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::WorldExtent;
    use crate::store::EntityStore;
    use crate::flow::FlowNetwork;
    use crate::planner::Planner;
    use crate::spatial::SpatialIndex;

    #[derive(Debug, Default)]
    struct TickCounter {
        seen: Vec<Ticks>,
    }

    impl Module for TickCounter {
        fn name(&self) -> &str {
            "tick_counter"
        }

        fn on_tick(&mut self, ctx: &ModuleContext<'_>) {
            self.seen.push(ctx.tick);
        }

        fn serialize_state(&self) -> Vec<u8> {
            (self.seen.len() as u64).to_le_bytes().to_vec()
        }

        fn load_state(&mut self, data: &[u8]) -> Result<(), ModuleError> {
            if data.is_empty() {
                self.seen.clear();
                return Ok(());
            }
            let bytes: [u8; 8] = data
                .try_into()
                .map_err(|_| ModuleError::DeserializeFailed(format!("{} bytes", data.len())))?;
            self.seen = vec![0; u64::from_le_bytes(bytes) as usize];
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct Silent;

    impl Module for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn empty_snapshot() -> TickSnapshot {
        TickSnapshot::capture(
            0,
            WorldExtent {
                width: 8,
                height: 8,
                chunk_size: 4,
            },
            &EntityStore::new(),
            &SpatialIndex::new(4, 8, 8),
            &FlowNetwork::new(),
            &Planner::default(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn modules_run_in_registration_order() {
        let mut host = ModuleHost::new();
        host.register(Box::new(TickCounter::default())).unwrap();
        host.register(Box::new(Silent)).unwrap();
        let snap = empty_snapshot();
        host.run(&ModuleContext {
            tick: 1,
            snapshot: &snap,
        });
        assert_eq!(host.get::<TickCounter>().unwrap().seen, vec![1]);
        assert_eq!(host.names().collect::<Vec<_>>(), vec!["tick_counter", "silent"]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut host = ModuleHost::new();
        host.register(Box::new(Silent)).unwrap();
        assert_eq!(
            host.register(Box::new(Silent)),
            Err(ModuleError::Duplicate("silent".into()))
        );
    }

    #[test]
    fn state_round_trips_through_host() {
        let mut host = ModuleHost::new();
        host.register(Box::new(TickCounter::default())).unwrap();
        host.get_mut::<TickCounter>().unwrap().seen = vec![4, 5, 6];
        let saved = host.save_states();

        let mut other = ModuleHost::new();
        other.register(Box::new(TickCounter::default())).unwrap();
        other.load_states(&saved).unwrap();
        assert_eq!(other.get::<TickCounter>().unwrap().seen.len(), 3);
    }

    #[test]
    fn bad_state_is_reported() {
        let mut host = ModuleHost::new();
        host.register(Box::new(TickCounter::default())).unwrap();
        let mut states = BTreeMap::new();
        states.insert("tick_counter".to_string(), vec![1, 2, 3]);
        assert!(matches!(
            host.load_states(&states),
            Err(ModuleError::DeserializeFailed(_))
        ));
    }
}

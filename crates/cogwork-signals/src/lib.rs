//! Tile signals for the Cogwork simulation.
//!
//! Machines advertise what they need by emitting signals onto their tile:
//! a backed-up output pushes, a starved input pulls, a stocked buffer
//! announces its contents and a faulted machine asks for work. Each tick
//! signals spread a fixed fraction to passable neighbours and decay, so
//! strength falls off with distance and a unit can walk "upstream" toward
//! the source.
//!
//! # Design
//!
//! - [`Signals`] is the plain field: sparse per-signal maps of tile to
//!   strength, stored in `BTreeMap`s so iteration and ties are stable.
//! - [`SignalsModule`] plugs the field into a world as a core module. It
//!   emits from the previous committed snapshot, so its results are the
//!   same for any worker count.
//! - All strengths are [`Fixed64`]; nothing here touches floating point
//!   after configuration.

use std::any::Any;
use std::collections::BTreeMap;

use cogwork_core::component::{Consumer, Inventory, MachineState, MachineStatus, Position, Producer};
use cogwork_core::fixed::{Fixed64, Ticks};
use cogwork_core::id::{EntityId, ResourceTypeId};
use cogwork_core::module::{Module, ModuleContext, ModuleError};
use cogwork_core::planner::{find_path, Goal, PlanView};
use cogwork_core::snapshot::TickSnapshot;
use cogwork_core::spatial::TilePos;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Signal types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Output of this resource is backing up and should be collected.
    Push(ResourceTypeId),
    /// This resource is needed.
    Pull(ResourceTypeId),
    /// This resource is stocked here.
    Contains(ResourceTypeId),
    /// This machine is faulted and needs attention.
    Work(EntityId),
}

/// Tuning for emission, spread and decay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Strength added per tick by each emitter.
    pub emit: Fixed64,
    /// Fraction sent to each passable neighbour per tick. Must stay below
    /// a quarter so a tile never sends more than it holds.
    pub diffusion: Fixed64,
    /// Fraction lost per tick.
    pub decay: Fixed64,
    /// Strengths below this are dropped.
    pub floor: Fixed64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            emit: Fixed64::from_num(1),
            diffusion: Fixed64::from_num(0.1),
            decay: Fixed64::from_num(0.1),
            floor: Fixed64::from_num(1) / Fixed64::from_num(4096),
        }
    }
}

impl SignalConfig {
    fn sanitized(mut self) -> Self {
        let max_diffusion = Fixed64::from_num(0.24);
        if self.diffusion > max_diffusion || self.diffusion < Fixed64::ZERO {
            tracing::warn!(diffusion = %self.diffusion, "diffusion out of range, clamping");
            self.diffusion = self.diffusion.clamp(Fixed64::ZERO, max_diffusion);
        }
        if self.decay > Fixed64::ONE || self.decay < Fixed64::ZERO {
            tracing::warn!(decay = %self.decay, "decay out of range, clamping");
            self.decay = self.decay.clamp(Fixed64::ZERO, Fixed64::ONE);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Signal field
// ---------------------------------------------------------------------------

type SignalMap = BTreeMap<TilePos, Fixed64>;

/// Strength of every signal on every tile it reaches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    maps: BTreeMap<Signal, SignalMap>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, signal: Signal, tile: TilePos, amount: Fixed64) {
        if amount <= Fixed64::ZERO {
            return;
        }
        *self
            .maps
            .entry(signal)
            .or_default()
            .entry(tile)
            .or_insert(Fixed64::ZERO) += amount;
    }

    /// Zero where the signal has not reached.
    pub fn strength(&self, signal: Signal, tile: TilePos) -> Fixed64 {
        self.maps
            .get(&signal)
            .and_then(|m| m.get(&tile))
            .copied()
            .unwrap_or(Fixed64::ZERO)
    }

    /// Every signal present on `tile`, in signal order.
    pub fn signals_at(&self, tile: TilePos) -> Vec<(Signal, Fixed64)> {
        self.maps
            .iter()
            .filter_map(|(signal, map)| map.get(&tile).map(|s| (*signal, *s)))
            .collect()
    }

    pub fn kinds(&self) -> impl Iterator<Item = Signal> + '_ {
        self.maps.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Move `fraction` of each tile's strength to each passable neighbour.
    /// Shares are computed from the strengths before any are moved.
    pub fn diffuse(&mut self, fraction: Fixed64, passable: impl Fn(TilePos) -> bool) {
        for map in self.maps.values_mut() {
            let mut delta: BTreeMap<TilePos, (Fixed64, Fixed64)> = BTreeMap::new();
            for (&tile, &strength) in map.iter() {
                let share = strength * fraction;
                if share <= Fixed64::ZERO {
                    continue;
                }
                for neighbor in tile.neighbors_4() {
                    if !passable(neighbor) {
                        continue;
                    }
                    delta.entry(tile).or_default().1 += share;
                    delta.entry(neighbor).or_default().0 += share;
                }
            }
            for (tile, (gain, loss)) in delta {
                let entry = map.entry(tile).or_insert(Fixed64::ZERO);
                *entry = (*entry + gain - loss).max(Fixed64::ZERO);
            }
        }
    }

    /// Scale every strength by `1 - fraction` and drop what falls below
    /// `floor`.
    pub fn decay(&mut self, fraction: Fixed64, floor: Fixed64) {
        let keep = Fixed64::ONE - fraction;
        for map in self.maps.values_mut() {
            for strength in map.values_mut() {
                *strength *= keep;
            }
            map.retain(|_, s| *s >= floor && *s > Fixed64::ZERO);
        }
        self.maps.retain(|_, m| !m.is_empty());
    }

    /// The passable neighbour of `tile` with the strongest `signal`, or
    /// `None` when no neighbour carries it. Ties go to the first neighbour
    /// in north, east, south, west order.
    pub fn upstream(
        &self,
        tile: TilePos,
        signal: Signal,
        passable: impl Fn(TilePos) -> bool,
    ) -> Option<TilePos> {
        let map = self.maps.get(&signal)?;
        let mut best: Option<(TilePos, Fixed64)> = None;
        for neighbor in tile.neighbors_4() {
            if !passable(neighbor) {
                continue;
            }
            let Some(&strength) = map.get(&neighbor) else {
                continue;
            };
            if best.is_none_or(|(_, s)| strength > s) {
                best = Some((neighbor, strength));
            }
        }
        best.map(|(t, _)| t)
    }

    /// The tile with the strongest `signal` within Manhattan distance
    /// `radius` of `tile`. Ties go to the lowest tile.
    pub fn strongest_within(
        &self,
        tile: TilePos,
        signal: Signal,
        radius: u32,
    ) -> Option<(TilePos, Fixed64)> {
        self.ranked_within(tile, signal, radius).into_iter().next()
    }

    /// Tiles within `radius`, strongest first.
    fn ranked_within(&self, tile: TilePos, signal: Signal, radius: u32) -> Vec<(TilePos, Fixed64)> {
        let Some(map) = self.maps.get(&signal) else {
            return Vec::new();
        };
        let mut found: Vec<(TilePos, Fixed64)> = map
            .iter()
            .filter(|(t, _)| t.manhattan_distance(&tile) <= radius)
            .map(|(t, s)| (*t, *s))
            .collect();
        // Stable sort keeps tile order among equal strengths.
        found.sort_by(|a, b| b.1.cmp(&a.1));
        found
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

/// Signals a snapshot's machines emit, in entity order.
pub fn emissions(snapshot: &TickSnapshot) -> Vec<(Signal, TilePos)> {
    let store = &snapshot.store;
    let mut out = Vec::new();
    for (id, state) in store.iter_of_type::<MachineState>() {
        let Ok(Position(tile)) = store.get::<Position>(id).copied() else {
            continue;
        };
        if store.is_errored(id) {
            out.push((Signal::Work(id), tile));
        }
        match state.status {
            MachineStatus::OutputBlocked => {
                if let Ok(producer) = store.get::<Producer>(id) {
                    out.push((Signal::Push(producer.resource), tile));
                }
            }
            MachineStatus::Starved => {
                if let Ok(consumer) = store.get::<Consumer>(id) {
                    out.push((Signal::Pull(consumer.resource), tile));
                }
                if let Some(ingredient) = store.get::<Producer>(id).ok().and_then(|p| p.requires) {
                    out.push((Signal::Pull(ingredient.resource), tile));
                }
            }
            MachineStatus::Idle | MachineStatus::Running => {}
        }
        if let Ok(inventory) = store.get::<Inventory>(id) {
            for (resource, buffer) in &inventory.buffers {
                if buffer.amount > Fixed64::ZERO {
                    out.push((Signal::Contains(*resource), tile));
                }
            }
        }
    }
    out
}

/// The non-unit entity standing on `tile`, if any.
fn occupant(snapshot: &TickSnapshot, tile: TilePos) -> Option<EntityId> {
    snapshot
        .store
        .iter_of_type::<Position>()
        .find(|(id, p)| p.0 == tile && snapshot.unit_position(*id).is_none())
        .map(|(id, _)| id)
}

// ---------------------------------------------------------------------------
// Module
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SignalState {
    signals: Signals,
    last_tick: Ticks,
}

/// Emits, diffuses and decays [`Signals`] once per tick.
#[derive(Debug, Clone, Default)]
pub struct SignalsModule {
    config: SignalConfig,
    state: SignalState,
}

impl SignalsModule {
    pub const NAME: &'static str = "signals";

    /// Candidates `suggest_goal` checks for a route before giving up.
    const MAX_CANDIDATES: usize = 8;

    pub fn new(config: SignalConfig) -> Self {
        Self {
            config: config.sanitized(),
            state: SignalState::default(),
        }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    pub fn signals(&self) -> &Signals {
        &self.state.signals
    }

    /// Tick of the last update.
    pub fn last_tick(&self) -> Ticks {
        self.state.last_tick
    }

    pub fn strength(&self, signal: Signal, tile: TilePos) -> Fixed64 {
        self.state.signals.strength(signal, tile)
    }

    /// Neighbour to step onto to follow `signal` toward its source.
    pub fn upstream(&self, snapshot: &TickSnapshot, tile: TilePos, signal: Signal) -> Option<TilePos> {
        self.state
            .signals
            .upstream(tile, signal, |t| snapshot.is_passable(t))
    }

    pub fn strongest_within(
        &self,
        tile: TilePos,
        signal: Signal,
        radius: u32,
    ) -> Option<(TilePos, Fixed64)> {
        self.state.signals.strongest_within(tile, signal, radius)
    }

    /// A goal toward the strongest `signal` within `radius` that a unit at
    /// `from` can reach. Machines and structures become `Visit` goals,
    /// open tiles `MoveTo` goals.
    pub fn suggest_goal(
        &self,
        snapshot: &TickSnapshot,
        from: TilePos,
        signal: Signal,
        radius: u32,
        search_limit: u32,
    ) -> Option<Goal> {
        if let Signal::Work(entity) = signal {
            self.state.signals.strongest_within(from, signal, radius)?;
            let target = snapshot.entity_position(entity)?;
            let goal = Goal::Visit(entity);
            return reachable(snapshot, from, goal, target, search_limit).then_some(goal);
        }
        self.state
            .signals
            .ranked_within(from, signal, radius)
            .into_iter()
            .take(Self::MAX_CANDIDATES)
            .find_map(|(tile, _)| {
                let goal = match occupant(snapshot, tile) {
                    Some(entity) => Goal::Visit(entity),
                    None => Goal::MoveTo(tile),
                };
                reachable(snapshot, from, goal, tile, search_limit).then_some(goal)
            })
    }

    fn update(&mut self, snapshot: &TickSnapshot, tick: Ticks) {
        let signals = &mut self.state.signals;
        let emitted = emissions(snapshot);
        for (signal, tile) in &emitted {
            signals.add(*signal, *tile, self.config.emit);
        }
        signals.diffuse(self.config.diffusion, |t| snapshot.is_passable(t));
        signals.decay(self.config.decay, self.config.floor);
        self.state.last_tick = tick;
        tracing::trace!(tick, emitters = emitted.len(), "signals updated");
    }
}

fn reachable(snapshot: &TickSnapshot, from: TilePos, goal: Goal, target: TilePos, limit: u32) -> bool {
    let reached = match goal {
        Goal::MoveTo(_) => from == target,
        Goal::Visit(_) => from.manhattan_distance(&target) == 1,
    };
    reached || find_path(from, goal, target, snapshot, limit).is_some()
}

impl Module for SignalsModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_tick(&mut self, ctx: &ModuleContext<'_>) {
        self.update(ctx.snapshot, ctx.tick);
    }

    fn serialize_state(&self) -> Vec<u8> {
        match bitcode::serialize(&self.state) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "signal state encode failed");
                Vec::new()
            }
        }
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), ModuleError> {
        if data.is_empty() {
            self.state = SignalState::default();
            return Ok(());
        }
        self.state = bitcode::deserialize(data)
            .map_err(|e| ModuleError::DeserializeFailed(format!("signals: {e}")))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogwork_core::test_utils::*;
    use cogwork_core::world::World;

    fn close(a: Fixed64, b: f64) -> bool {
        (a - fixed(b)).abs() < fixed(0.0001)
    }

    fn open(_: TilePos) -> bool {
        true
    }

    const ORIGIN: TilePos = TilePos::new(5, 5);

    // -----------------------------------------------------------------------
    // Field
    // -----------------------------------------------------------------------

    #[test]
    fn diffusion_sends_a_tenth_to_each_open_neighbour() {
        let mut field = Signals::new();
        let signal = Signal::Contains(ore());
        field.add(signal, ORIGIN, fixed(100.0));
        field.diffuse(fixed(0.1), open);

        assert!(close(field.strength(signal, ORIGIN), 60.0));
        for n in ORIGIN.neighbors_4() {
            assert!(close(field.strength(signal, n), 10.0), "{n:?}");
        }
    }

    #[test]
    fn walls_keep_their_share_at_home() {
        let mut field = Signals::new();
        let signal = Signal::Push(ore());
        let wall = TilePos::new(6, 5);
        field.add(signal, ORIGIN, fixed(100.0));
        field.diffuse(fixed(0.1), |t| t != wall);

        assert_eq!(field.strength(signal, wall), Fixed64::ZERO);
        assert!(close(field.strength(signal, ORIGIN), 70.0));
    }

    #[test]
    fn decay_fades_to_nothing() {
        let mut field = Signals::new();
        field.add(Signal::Pull(plate()), ORIGIN, fixed(1.0));
        field.decay(fixed(0.1), Fixed64::ZERO);
        assert!(close(field.strength(Signal::Pull(plate()), ORIGIN), 0.9));

        let config = SignalConfig::default();
        for _ in 0..300 {
            field.diffuse(config.diffusion, open);
            field.decay(config.decay, config.floor);
        }
        assert!(field.is_empty());
    }

    #[test]
    fn strengths_never_go_negative() {
        let mut field = Signals::new();
        let signal = Signal::Contains(water());
        field.add(signal, ORIGIN, fixed(0.000_01));
        field.add(signal, TilePos::new(5, 6), fixed(50.0));
        for _ in 0..20 {
            field.diffuse(fixed(0.24), open);
            field.decay(fixed(0.1), Fixed64::ZERO);
        }
        for signal in field.kinds().collect::<Vec<_>>() {
            for n in ORIGIN.neighbors_4() {
                assert!(field.strength(signal, n) >= Fixed64::ZERO);
            }
        }
    }

    #[test]
    fn upstream_picks_the_strongest_open_neighbour() {
        let mut field = Signals::new();
        let signal = Signal::Pull(ore());
        field.add(signal, TilePos::new(5, 4), fixed(3.0));
        field.add(signal, TilePos::new(6, 5), fixed(5.0));
        field.add(signal, TilePos::new(4, 5), fixed(9.0));

        assert_eq!(field.upstream(ORIGIN, signal, open), Some(TilePos::new(4, 5)));
        let blocked = TilePos::new(4, 5);
        assert_eq!(
            field.upstream(ORIGIN, signal, |t| t != blocked),
            Some(TilePos::new(6, 5))
        );
        assert_eq!(field.upstream(ORIGIN, Signal::Push(ore()), open), None);
    }

    #[test]
    fn strongest_within_respects_radius() {
        let mut field = Signals::new();
        let signal = Signal::Contains(ore());
        field.add(signal, TilePos::new(5, 7), fixed(2.0));
        field.add(signal, TilePos::new(5, 12), fixed(8.0));

        assert_eq!(
            field.strongest_within(ORIGIN, signal, 3),
            Some((TilePos::new(5, 7), fixed(2.0)))
        );
        assert_eq!(
            field.strongest_within(ORIGIN, signal, 10),
            Some((TilePos::new(5, 12), fixed(8.0)))
        );
        assert_eq!(field.strongest_within(ORIGIN, signal, 1), None);
    }

    // -----------------------------------------------------------------------
    // Module in a world
    // -----------------------------------------------------------------------

    /// A source with nowhere to send its output, so it backs up.
    fn blocked_source_world() -> (World, EntityId) {
        let mut world = World::new(small_config()).unwrap();
        world
            .register_module(Box::new(SignalsModule::new(SignalConfig::default())))
            .unwrap();
        let source = world
            .place(source(TilePos::new(1, 1), ore(), 15.0, 20.0))
            .unwrap();
        (world, source)
    }

    #[test]
    fn backed_up_source_pushes() {
        let (mut world, source) = blocked_source_world();
        for _ in 0..10 {
            world.step().unwrap();
        }
        let module = world.module::<SignalsModule>().unwrap();
        let push = Signal::Push(ore());
        assert!(module.strength(push, TilePos::new(1, 1)) > Fixed64::ZERO);
        assert!(module.strength(push, TilePos::new(2, 1)) > module.strength(push, TilePos::new(3, 1)));
        assert!(module.strength(Signal::Contains(ore()), TilePos::new(2, 1)) > Fixed64::ZERO);
        assert_eq!(module.strength(Signal::Pull(ore()), TilePos::new(2, 1)), Fixed64::ZERO);
        assert_eq!(module.last_tick(), 10);

        let snapshot = world.latest();
        assert_eq!(
            module.upstream(&snapshot, TilePos::new(4, 1), push),
            Some(TilePos::new(3, 1))
        );
        assert_eq!(
            module.suggest_goal(&snapshot, TilePos::new(4, 1), push, 6, 1000),
            Some(Goal::Visit(source))
        );
        assert_eq!(
            module.suggest_goal(&snapshot, TilePos::new(4, 1), Signal::Pull(plate()), 6, 1000),
            None
        );
    }

    #[test]
    fn starved_sink_pulls() {
        let mut world = World::new(small_config()).unwrap();
        world
            .register_module(Box::new(SignalsModule::new(SignalConfig::default())))
            .unwrap();
        world
            .place(sink(TilePos::new(8, 8), plate(), 5.0, 10.0))
            .unwrap();
        for _ in 0..6 {
            world.step().unwrap();
        }
        let module = world.module::<SignalsModule>().unwrap();
        assert!(module.strength(Signal::Pull(plate()), TilePos::new(8, 9)) > Fixed64::ZERO);
        assert_eq!(
            module.strongest_within(TilePos::new(8, 9), Signal::Pull(plate()), 2).map(|(t, _)| t),
            Some(TilePos::new(8, 8))
        );
    }

    #[test]
    fn state_survives_snapshot_restore() {
        let (mut world, _) = blocked_source_world();
        for _ in 0..6 {
            world.step().unwrap();
        }
        let before = world.module::<SignalsModule>().unwrap().signals().clone();
        assert!(!before.is_empty());

        let mut restored = World::from_snapshot(small_config(), (*world.latest()).clone()).unwrap();
        restored
            .register_module(Box::new(SignalsModule::new(SignalConfig::default())))
            .unwrap();
        assert_eq!(restored.module::<SignalsModule>().unwrap().signals(), &before);

        for _ in 0..4 {
            assert_eq!(world.step().unwrap().state_hash, restored.step().unwrap().state_hash);
        }
    }

    #[test]
    fn corrupt_state_is_rejected() {
        let mut module = SignalsModule::new(SignalConfig::default());
        assert!(module.load_state(&[0xff, 0x01]).is_err());
        assert!(module.load_state(&[]).is_ok());
    }

    #[test]
    fn out_of_range_config_is_clamped() {
        let module = SignalsModule::new(SignalConfig {
            diffusion: fixed(0.5),
            decay: fixed(2.0),
            ..SignalConfig::default()
        });
        assert!(module.config().diffusion <= fixed(0.24));
        assert_eq!(module.config().decay, Fixed64::ONE);
    }
}

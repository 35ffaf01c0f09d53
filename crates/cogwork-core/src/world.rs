//! The world: live state, the tick pipeline and the clock.
//!
//! # Tick pipeline
//!
//! Each tick runs:
//! 1. **Pre-tick** -- apply queued commands, then seed newly touched chunks
//! 2. **Batches** -- flow resolution, then the nine spatial colour batches,
//!    each committed before the next one starts
//! 3. **Planner slot** -- advance unit tasks against the previous snapshot
//!    and write the resulting routes
//! 4. **Modules** -- registered observers run
//! 5. **Commit** -- capture and hash the snapshot, publish it, advance the clock
//!
//! Nothing is published before step 5. A panic or failure in steps 1-5
//! restores the live state from the last checkpoint, re-queues the tick's
//! commands and retries, up to `max_tick_attempts` times.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{StateHash, WorldClock};
use crate::command_queue::{Command, CommandQueue};
use crate::component::{EntityFault, EntityKind, Mover, Position};
use crate::config::{ConfigError, SimConfig};
use crate::event::{Event, EventKind, EventLog};
use crate::fixed::Ticks;
use crate::flow::{FlowNetwork, FlowResolution};
use crate::handler::{HandlerRegistry, UpdateHandler};
use crate::id::{EntityId, TaskId};
use crate::module::{Module, ModuleContext, ModuleError, ModuleHost};
use crate::placement::{self, Placement, ValidationError};
use crate::planner::{
    FailureReason, Goal, PathProposal, Planner, PlannerError, PlannerLimits, TaskTransition,
};
use crate::replay::{ReplayError, ReplayInput, ReplayLog};
use crate::scheduler::{BatchOutcome, Scheduler};
use crate::serialize::{self, DeserializeError, SerializeError};
use crate::snapshot::{
    LiveState, RestoreError, SnapshotHandle, SnapshotHistory, TickSnapshot, WorldExtent,
};
use crate::spatial::{ChunkCoord, SpatialIndex, TileRect};
use crate::store::EntityStore;
use crate::worldgen::{ChunkGenerator, EmptyGenerator, seed_chunk};

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Everything a committed tick produced.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: Ticks,
    pub snapshot: Arc<TickSnapshot>,
    /// Events of this tick, plus those of immediate operations since the
    /// previous commit.
    pub events: Vec<Event>,
    pub faults: Vec<(EntityId, EntityFault)>,
    pub flow: FlowResolution,
    pub transitions: Vec<TaskTransition>,
    /// Units that changed tile.
    pub moved: u32,
    pub state_hash: StateHash,
    /// 1 unless earlier attempts were discarded.
    pub attempts: u32,
}

/// Result of [`World::advance`].
#[derive(Debug, Clone, Default)]
pub struct AdvanceResult {
    pub steps_run: u64,
    pub reports: Vec<TickReport>,
}

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("tick {tick} discarded after {attempts} attempts: {reason}")]
    Discarded {
        tick: Ticks,
        attempts: u32,
        reason: String,
    },
    #[error("checkpoint for tick {tick} could not be restored: {source}")]
    Restore {
        tick: Ticks,
        #[source]
        source: RestoreError,
    },
    #[error("module state could not be restored: {0}")]
    Module(#[from] ModuleError),
}

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Load(#[from] DeserializeError),
    #[error(transparent)]
    Save(#[from] SerializeError),
}

/// Output of one attempt, held until the tick commits.
struct Phases {
    snapshot: TickSnapshot,
    state_hash: StateHash,
    faults: Vec<(EntityId, EntityFault)>,
    flow: FlowResolution,
    transitions: Vec<TaskTransition>,
    moved: u32,
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

pub struct World {
    config: SimConfig,
    extent: WorldExtent,
    clock: WorldClock,

    // -- Live state --
    store: EntityStore,
    spatial: SpatialIndex,
    flow: FlowNetwork,
    planner: Planner,

    scheduler: Scheduler,
    modules: ModuleHost,
    generator: Box<dyn ChunkGenerator>,
    commands: CommandQueue,
    events: EventLog,

    // -- Published state --
    history: SnapshotHistory,
    handle: SnapshotHandle,
    last_hash: StateHash,

    /// Live state was changed outside a tick since the last commit.
    dirty: bool,
    recorder: Option<ReplayLog>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("tick", &self.clock.tick())
            .field("extent", &self.extent)
            .field("entities", &self.store.len())
            .field("connections", &self.flow.len())
            .field("tasks", &self.planner.len())
            .field("modules", &self.modules.len())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl World {
    /// An empty world at tick 0.
    pub fn new(config: SimConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let extent = WorldExtent {
            width: config.world_width,
            height: config.world_height,
            chunk_size: config.chunk_size,
        };
        let live = LiveState {
            store: EntityStore::new(),
            spatial: SpatialIndex::new(extent.chunk_size, extent.width, extent.height),
            flow: FlowNetwork::new(),
            planner: Planner::default(),
        };
        let initial = TickSnapshot::capture(
            0,
            extent,
            &live.store,
            &live.spatial,
            &live.flow,
            &live.planner,
            Default::default(),
        );
        Self::assemble(config, initial, live)
    }

    /// Continue from a committed snapshot. The snapshot's extent wins over
    /// the config's world size.
    pub fn from_snapshot(config: SimConfig, snapshot: TickSnapshot) -> Result<Self, WorldError> {
        config.validate()?;
        let live = snapshot.restore()?;
        Self::assemble(config, snapshot, live)
    }

    /// [`from_snapshot`](Self::from_snapshot) on a file written by
    /// [`save`](Self::save).
    pub fn load(config: SimConfig, path: &Path) -> Result<Self, WorldError> {
        let snapshot = serialize::load_from_path(path)?;
        Self::from_snapshot(config, snapshot)
    }

    fn assemble(
        mut config: SimConfig,
        snapshot: TickSnapshot,
        live: LiveState,
    ) -> Result<Self, WorldError> {
        let extent = snapshot.extent;
        if (extent.width, extent.height, extent.chunk_size)
            != (config.world_width, config.world_height, config.chunk_size)
        {
            tracing::warn!(
                width = extent.width,
                height = extent.height,
                chunk_size = extent.chunk_size,
                "snapshot extent overrides configured world size"
            );
            config.world_width = extent.width;
            config.world_height = extent.height;
            config.chunk_size = extent.chunk_size;
        }
        let scheduler =
            Scheduler::new(config.resolved_worker_count(), HandlerRegistry::with_builtins())?;
        let last_hash = serialize::state_hash(&snapshot)?;
        let snapshot = Arc::new(snapshot);
        let mut history = SnapshotHistory::new(config.snapshot_history);
        history.push(Arc::clone(&snapshot));

        let mut world = Self {
            clock: WorldClock::starting_at(snapshot.tick, config.tick_rate),
            extent,
            store: live.store,
            spatial: live.spatial,
            flow: live.flow,
            planner: live.planner,
            scheduler,
            modules: ModuleHost::new(),
            generator: Box::new(EmptyGenerator),
            commands: CommandQueue::with_max_history(config.command_history),
            events: EventLog::new(),
            history,
            handle: SnapshotHandle::new(snapshot),
            last_hash,
            dirty: false,
            recorder: None,
            config,
        };
        world.planner.set_limits(world.planner_limits());
        tracing::info!(
            tick = world.clock.tick(),
            workers = world.scheduler.worker_count(),
            entities = world.store.len(),
            "world ready"
        );
        Ok(world)
    }

    fn planner_limits(&self) -> PlannerLimits {
        PlannerLimits {
            retry_limit: self.config.task_retry_limit,
            search_limit: self.config.path_search_limit,
            stall_limit: self.config.task_stall_limit,
        }
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    pub fn set_generator(&mut self, generator: Box<dyn ChunkGenerator>) {
        self.generator = generator;
    }

    /// Custom handlers run after the built-ins for the same capability.
    pub fn register_handler(&mut self, handler: Arc<dyn UpdateHandler>) {
        self.scheduler.handlers_mut().register(handler);
    }

    /// Register a module. State saved under its name in the latest snapshot
    /// is loaded into it first.
    pub fn register_module(&mut self, mut module: Box<dyn Module>) -> Result<(), ModuleError> {
        if let Some(data) = self.latest().extensions.get(module.name()) {
            module.load_state(data)?;
        }
        self.modules.register(module)?;
        self.dirty = true;
        Ok(())
    }

    pub fn module<T: Module + 'static>(&self) -> Option<&T> {
        self.modules.get::<T>()
    }

    pub fn module_mut<T: Module + 'static>(&mut self) -> Option<&mut T> {
        self.modules.get_mut::<T>()
    }

    pub fn suppress_event(&mut self, kind: EventKind) {
        self.events.suppress(kind);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn extent(&self) -> WorldExtent {
        self.extent
    }

    /// Last committed tick.
    pub fn current_tick(&self) -> Ticks {
        self.clock.tick()
    }

    pub fn clock(&self) -> &WorldClock {
        &self.clock
    }

    /// The latest committed snapshot.
    pub fn latest(&self) -> Arc<TickSnapshot> {
        self.handle.latest()
    }

    /// A handle other threads can poll for the latest snapshot.
    pub fn handle(&self) -> SnapshotHandle {
        self.handle.clone()
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    /// Hash of the latest committed snapshot.
    pub fn state_hash(&self) -> StateHash {
        self.last_hash
    }

    /// Live store, including immediate changes not yet committed.
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn spatial(&self) -> &SpatialIndex {
        &self.spatial
    }

    pub fn flow(&self) -> &FlowNetwork {
        &self.flow
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn pending_commands(&self) -> &[Command] {
        self.commands.pending()
    }

    /// Executed commands with their tick, oldest first. Empty unless
    /// `command_history` is configured.
    pub fn command_history(&self) -> &[(Ticks, Command)] {
        self.commands.history()
    }

    pub fn clear_command_history(&mut self) {
        self.commands.clear_history();
    }

    // -----------------------------------------------------------------------
    // Immediate operations
    // -----------------------------------------------------------------------

    /// Validate and create an entity now. It becomes visible in the next
    /// committed snapshot.
    pub fn place(&mut self, placement: impl Into<Placement>) -> Result<EntityId, ValidationError> {
        let placement = placement.into();
        let tick = self.clock.tick() + 1;
        let recorded = self.recorder.is_some().then(|| placement.clone());
        let kind = placement.components.kind;

        self.store.set_current_tick(tick);
        let (entity, connections) = placement::apply(
            placement,
            &mut self.store,
            &mut self.spatial,
            &mut self.flow,
            &[],
        )?;
        self.events.emit(Event::EntityCreated { entity, kind, tick });
        for connection in connections {
            self.events.emit(Event::ConnectionAdded { connection, tick });
        }
        if let (Some(log), Some(placement)) = (self.recorder.as_mut(), recorded) {
            log.note(ReplayInput::Place(placement));
        }
        self.dirty = true;
        Ok(entity)
    }

    /// Queue `goal` on a unit. Planning starts with the next tick that
    /// sees the unit in its previous snapshot.
    pub fn assign_task(&mut self, unit: EntityId, goal: Goal) -> Result<TaskId, PlannerError> {
        if !matches!(self.store.kind(unit), Ok(EntityKind::Unit)) {
            return Err(PlannerError::NotAUnit(unit));
        }
        let task = self.planner.assign(unit, goal, self.clock.tick() + 1);
        if let Some(log) = self.recorder.as_mut() {
            log.note(ReplayInput::AssignTask { unit, goal });
        }
        self.dirty = true;
        Ok(task)
    }

    /// Mark chunks overlapping `bounds` for generation in the next tick.
    pub fn touch_region(&mut self, bounds: TileRect) {
        self.spatial.touch_region(bounds);
        if let Some(log) = self.recorder.as_mut() {
            log.note(ReplayInput::TouchRegion(bounds));
        }
    }

    /// Queue a command for the next tick's pre-tick slot.
    pub fn submit(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn submit_batch(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.push_batch(commands);
    }

    // -----------------------------------------------------------------------
    // Clock
    // -----------------------------------------------------------------------

    /// Stop [`advance`](Self::advance) from running ticks. Explicit
    /// [`tick`](Self::tick) and [`step`](Self::step) calls still run.
    pub fn pause(&mut self) {
        self.clock.pause();
    }

    pub fn resume(&mut self) {
        self.clock.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.clock.is_paused()
    }

    /// Bank `elapsed` real time and run every tick that is now due. On
    /// failure the ticks that did not run are banked again.
    pub fn advance(&mut self, elapsed: Duration) -> Result<AdvanceResult, TickError> {
        let due = self.clock.accumulate(elapsed);
        let mut result = AdvanceResult::default();
        for done in 0..due {
            match self.step() {
                Ok(report) => {
                    result.steps_run += 1;
                    result.reports.push(report);
                }
                Err(err) => {
                    self.clock.refund(due - done);
                    return Err(err);
                }
            }
        }
        Ok(result)
    }

    /// Run one tick and return its snapshot.
    pub fn tick(&mut self) -> Result<Arc<TickSnapshot>, TickError> {
        self.step().map(|report| report.snapshot)
    }

    /// Run one tick and return everything it produced.
    pub fn step(&mut self) -> Result<TickReport, TickError> {
        let tick = self.clock.tick() + 1;
        let _span = tracing::info_span!("tick", tick).entered();

        let previous = self.latest();
        let checkpoint = if self.dirty {
            Arc::new(self.capture(self.clock.tick()))
        } else {
            Arc::clone(&previous)
        };
        let pending_seeds: Vec<ChunkCoord> = self.spatial.pending_seeds().collect();
        let event_mark = self.events.len();
        let max_attempts = self.config.max_tick_attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=max_attempts {
            let commands = self.commands.drain(tick);
            let result = catch_unwind(AssertUnwindSafe(|| {
                self.run_phases(tick, &commands, &previous)
            }));
            let failure = match result {
                Ok(Ok(phases)) => return Ok(self.commit_tick(tick, phases, commands, attempt)),
                Ok(Err(err)) => err.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            tracing::warn!(tick, attempt, reason = %failure, "tick attempt failed");
            self.commands.requeue(tick, commands);
            self.events.truncate(event_mark);
            self.rollback(&checkpoint, &pending_seeds)?;
            reason = failure;
        }

        tracing::error!(tick, attempts = max_attempts, %reason, "tick discarded");
        Err(TickError::Discarded {
            tick,
            attempts: max_attempts,
            reason,
        })
    }

    fn capture(&self, tick: Ticks) -> TickSnapshot {
        TickSnapshot::capture(
            tick,
            self.extent,
            &self.store,
            &self.spatial,
            &self.flow,
            &self.planner,
            self.modules.save_states(),
        )
    }

    fn run_phases(
        &mut self,
        tick: Ticks,
        commands: &[Command],
        previous: &TickSnapshot,
    ) -> Result<Phases, SerializeError> {
        self.store.set_current_tick(tick);

        // Phase 1: pre-tick.
        let mut transitions = Vec::new();
        for command in commands {
            self.apply_command(command.clone(), tick, &mut transitions);
        }
        for chunk in self.spatial.take_pending_seeds() {
            seed_chunk(
                self.generator.as_ref(),
                chunk,
                tick,
                &mut self.store,
                &mut self.spatial,
                &mut self.flow,
                &mut self.events,
            );
        }

        // Phase 2: batches.
        let plan = self
            .scheduler
            .plan_tick(&self.store, &mut self.spatial, &mut self.flow);
        let mut flow = FlowResolution::default();
        let mut faults = Vec::new();
        let mut moved = 0;
        for batch in &plan.batches {
            let outcome = self.scheduler.execute_batch(
                batch,
                tick,
                &self.store,
                &self.spatial,
                &self.flow,
                self.config.flow_iteration_cap,
            );
            let summary = self.scheduler.commit(
                &outcome,
                tick,
                &mut self.store,
                &mut self.spatial,
                &self.flow,
                &mut self.events,
            );
            faults.extend(summary.faults);
            moved += summary.moved;
            if let BatchOutcome::Flow(resolution) = outcome {
                flow = resolution;
            }
        }

        // Phase 3: planner slot.
        let output = self.planner.run_slot(previous, tick);
        self.commit_proposals(&output.proposals);
        for transition in &output.transitions {
            self.events.emit(transition_event(transition, tick));
        }
        transitions.extend(output.transitions);

        // Phase 4: modules.
        self.modules.run(&ModuleContext {
            tick,
            snapshot: previous,
        });

        // Phase 5 (first half): capture. Publishing waits for the caller.
        let snapshot = self.capture(tick);
        let state_hash = serialize::state_hash(&snapshot)?;
        Ok(Phases {
            snapshot,
            state_hash,
            faults,
            flow,
            transitions,
            moved,
        })
    }

    fn commit_tick(
        &mut self,
        tick: Ticks,
        phases: Phases,
        commands: Vec<Command>,
        attempts: u32,
    ) -> TickReport {
        self.clock.commit();
        let snapshot = Arc::new(phases.snapshot);
        self.history.push(Arc::clone(&snapshot));
        self.handle.publish(Arc::clone(&snapshot));
        self.last_hash = phases.state_hash;
        self.dirty = false;
        if let Some(log) = self.recorder.as_mut() {
            log.record(tick, commands, phases.state_hash);
        }

        let events = self.events.drain();
        tracing::debug!(
            tick,
            events = events.len(),
            faults = phases.faults.len(),
            moved = phases.moved,
            hash = %phases.state_hash,
            "tick committed"
        );
        TickReport {
            tick,
            snapshot,
            events,
            faults: phases.faults,
            flow: phases.flow,
            transitions: phases.transitions,
            moved: phases.moved,
            state_hash: phases.state_hash,
            attempts,
        }
    }

    fn rollback(
        &mut self,
        checkpoint: &TickSnapshot,
        pending_seeds: &[ChunkCoord],
    ) -> Result<(), TickError> {
        let live = checkpoint.restore().map_err(|source| TickError::Restore {
            tick: checkpoint.tick,
            source,
        })?;
        self.store = live.store;
        self.spatial = live.spatial;
        self.flow = live.flow;
        self.planner = live.planner;
        self.planner.set_limits(self.planner_limits());
        for &chunk in pending_seeds {
            let bounds = self.spatial.chunk_bounds(chunk);
            self.spatial.touch_region(bounds);
        }
        self.scheduler.invalidate();
        self.modules.load_states(&checkpoint.extensions)?;
        Ok(())
    }

    // -- Pre-tick commands --

    fn apply_command(
        &mut self,
        command: Command,
        tick: Ticks,
        transitions: &mut Vec<TaskTransition>,
    ) {
        match command {
            Command::Place(placement) => {
                let kind = placement.components.kind;
                match placement::apply(
                    placement,
                    &mut self.store,
                    &mut self.spatial,
                    &mut self.flow,
                    &[],
                ) {
                    Ok((entity, connections)) => {
                        self.events.emit(Event::EntityCreated { entity, kind, tick });
                        for connection in connections {
                            self.events.emit(Event::ConnectionAdded { connection, tick });
                        }
                    }
                    Err(err) => {
                        tracing::debug!(%err, "queued placement rejected");
                        self.events.emit(Event::PlacementRejected {
                            reason: err.to_string(),
                            tick,
                        });
                    }
                }
            }
            Command::Destroy(entity) => self.destroy_entity(entity, tick, transitions),
            Command::CancelTask(task) => match self.planner.cancel(task, tick) {
                Ok(Some(transition)) => {
                    if let Ok(mover) = self.store.get_mut::<Mover>(transition.unit) {
                        if mover.task == Some(task) {
                            mover.task = None;
                            mover.path.clear();
                        }
                    }
                    self.events.emit(transition_event(&transition, tick));
                    transitions.push(transition);
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(%err, "cancel ignored"),
            },
            Command::Repair(entity) => match self.store.clear_fault(entity) {
                Ok(true) => {
                    tracing::info!(%entity, "entity repaired");
                    self.events.emit(Event::EntityRepaired { entity, tick });
                }
                Ok(false) => {}
                Err(err) => tracing::debug!(%err, "repair ignored"),
            },
        }
    }

    fn destroy_entity(
        &mut self,
        entity: EntityId,
        tick: Ticks,
        transitions: &mut Vec<TaskTransition>,
    ) {
        if !self.store.is_live(entity) {
            tracing::debug!(%entity, "destroy ignored for dead entity");
            return;
        }
        for conn in self.flow.disconnect_entity(entity) {
            self.events.emit(Event::ConnectionRemoved {
                connection: conn.id,
                tick,
            });
        }
        for transition in self.planner.fail_unit(entity, FailureReason::UnitGone, tick) {
            self.events.emit(transition_event(&transition, tick));
            transitions.push(transition);
        }
        // Entities without a position were never indexed.
        let _ = self.spatial.remove(entity);
        if self.store.destroy(entity).is_ok() {
            self.events.emit(Event::EntityDestroyed { entity, tick });
        }
    }

    // -- Planner slot --

    /// Write routes into live movers. Proposals were planned from the
    /// previous snapshot, so the part the unit walked this tick is dropped.
    fn commit_proposals(&mut self, proposals: &[PathProposal]) {
        for proposal in proposals {
            let Ok(at) = self.store.get::<Position>(proposal.unit).map(|p| p.0) else {
                continue;
            };
            let Ok(mover) = self.store.get_mut::<Mover>(proposal.unit) else {
                continue;
            };
            let mut path = proposal.path.clone();
            if let Some(i) = path.iter().position(|p| *p == at) {
                path.drain(..=i);
            }
            mover.path = path;
            mover.task = proposal.task;
            mover.stalled_ticks = 0;
        }
    }

    // -----------------------------------------------------------------------
    // Persistence and replay
    // -----------------------------------------------------------------------

    /// Save the latest committed snapshot. Immediate changes since then
    /// are not included.
    pub fn save(&self, path: &Path) -> Result<(), SerializeError> {
        serialize::save_to_path(&self.latest(), path)
    }

    /// Start recording inputs and per-tick hashes from the latest committed
    /// snapshot.
    pub fn start_recording(&mut self) -> Result<(), ReplayError> {
        if self.dirty {
            return Err(ReplayError::Uncommitted);
        }
        let mut log = ReplayLog::begin(&self.latest())?;
        for chunk in self.spatial.pending_seeds() {
            log.note(ReplayInput::TouchRegion(self.spatial.chunk_bounds(chunk)));
        }
        self.recorder = Some(log);
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn stop_recording(&mut self) -> Option<ReplayLog> {
        self.recorder.take()
    }
}

fn transition_event(t: &TaskTransition, tick: Ticks) -> Event {
    Event::TaskStateChanged {
        task: t.task,
        unit: t.unit,
        from: t.from,
        to: t.to,
        tick,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Inventory, MachineState, MachineStatus};
    use crate::fixed::Fixed64;
    use crate::planner::TaskState;
    use crate::spatial::TilePos;
    use crate::test_utils::*;

    fn kinds(report: &TickReport) -> Vec<EventKind> {
        report.events.iter().map(Event::kind).collect()
    }

    // -----------------------------------------------------------------------
    // Clock and publication
    // -----------------------------------------------------------------------

    #[test]
    fn new_world_publishes_tick_zero() {
        let world = World::new(small_config()).unwrap();
        assert_eq!(world.current_tick(), 0);
        assert_eq!(world.latest().tick, 0);
        assert_eq!(world.history().len(), 1);
    }

    #[test]
    fn ticks_strictly_increase() {
        let mut world = World::new(small_config()).unwrap();
        let handle = world.handle();
        for expected in 1..=5 {
            let snap = world.tick().unwrap();
            assert_eq!(snap.tick, expected);
            assert_eq!(handle.latest().tick, expected);
        }
        let ticks: Vec<_> = world.history().iter().map(|s| s.tick).collect();
        assert_eq!(ticks, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn published_snapshot_never_changes() {
        let mut world = World::new(small_config()).unwrap();
        let conveyor = conveyor_line(&mut world);
        let first = world.tick().unwrap();
        let before = amount(&first.store, conveyor.source, ore());
        for _ in 0..3 {
            world.tick().unwrap();
        }
        assert_eq!(amount(&first.store, conveyor.source, ore()), before);
        assert_eq!(first.tick, 1);
    }

    #[test]
    fn advance_runs_whole_steps_and_carries_remainder() {
        let mut world = World::new(small_config()).unwrap();
        let result = world.advance(Duration::from_millis(50)).unwrap();
        assert_eq!(result.steps_run, 3);
        assert_eq!(world.current_tick(), 3);
        assert!(world.clock().accumulated() < world.clock().step());
    }

    #[test]
    fn paused_world_does_not_advance() {
        let mut world = World::new(small_config()).unwrap();
        world.pause();
        let result = world.advance(Duration::from_secs(1)).unwrap();
        assert_eq!(result.steps_run, 0);
        assert_eq!(world.current_tick(), 0);

        // Single steps still work while paused.
        world.tick().unwrap();
        assert_eq!(world.current_tick(), 1);

        world.resume();
        assert_eq!(world.advance(Duration::from_millis(20)).unwrap().steps_run, 1);
    }

    // -----------------------------------------------------------------------
    // Flow and machines
    // -----------------------------------------------------------------------

    #[test]
    fn conveyor_moves_sink_rate_and_source_backs_up() {
        let mut world = World::new(small_config()).unwrap();
        let conveyor = conveyor_line(&mut world);

        let first = world.step().unwrap();
        assert_eq!(first.flow.transfer(conveyor.link), Fixed64::ZERO);
        for _ in 0..11 {
            let report = world.step().unwrap();
            assert_eq!(report.flow.transfer(conveyor.link), fixed(5.0));
        }
        let store = world.store();
        assert_eq!(amount(store, conveyor.source, ore()), fixed(100.0));
        assert_eq!(
            store.get::<MachineState>(conveyor.source).unwrap().status,
            MachineStatus::OutputBlocked
        );
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    #[test]
    fn destroy_removes_entity_and_links() {
        let mut world = World::new(small_config()).unwrap();
        let conveyor = conveyor_line(&mut world);
        world.tick().unwrap();

        world.submit(Command::Destroy(conveyor.sink));
        let report = world.step().unwrap();
        let kinds = kinds(&report);
        assert!(kinds.contains(&EventKind::ConnectionRemoved));
        assert!(kinds.contains(&EventKind::EntityDestroyed));
        assert!(world.flow().is_empty());
        assert!(world.store().get::<Inventory>(conveyor.sink).is_err());
        assert!(report.snapshot.position_of(conveyor.sink).is_none());
    }

    #[test]
    fn rejected_command_placement_is_reported() {
        let mut world = World::new(small_config()).unwrap();
        let conveyor = conveyor_line(&mut world);
        world.submit(Command::Place(Placement::new(wall(1, 1))));
        let report = world.step().unwrap();
        assert!(kinds(&report).contains(&EventKind::PlacementRejected));
        assert_eq!(world.spatial().occupant(TilePos::new(1, 1)), Some(conveyor.source));
    }

    #[test]
    fn immediate_placement_rejects_occupied_tile() {
        let mut world = World::new(small_config()).unwrap();
        conveyor_line(&mut world);
        assert!(matches!(
            world.place(wall(4, 1)),
            Err(ValidationError::Occupied { .. })
        ));
    }

    #[test]
    fn faulted_entity_stays_frozen_until_repaired() {
        let mut world = World::new(small_config()).unwrap();
        let conveyor = conveyor_line(&mut world);
        world.register_handler(Arc::new(FaultOnce::new(conveyor.source)));

        let report = world.step().unwrap();
        assert_eq!(report.faults.len(), 1);
        assert!(kinds(&report).contains(&EventKind::EntityErrored));
        for _ in 0..3 {
            world.step().unwrap();
        }
        assert!(world.store().is_errored(conveyor.source));
        assert_eq!(amount(world.store(), conveyor.source, ore()), Fixed64::ZERO);

        world.submit(Command::Repair(conveyor.source));
        let report = world.step().unwrap();
        assert!(kinds(&report).contains(&EventKind::EntityRepaired));
        assert!(!world.store().is_errored(conveyor.source));
        assert_eq!(amount(world.store(), conveyor.source, ore()), fixed(15.0));
    }

    // -----------------------------------------------------------------------
    // Units
    // -----------------------------------------------------------------------

    #[test]
    fn unit_walks_to_goal_and_completes() {
        let mut world = World::new(small_config()).unwrap();
        let unit = world.place(unit_at(1, 6)).unwrap();
        let task = world.assign_task(unit, Goal::MoveTo(TilePos::new(5, 6))).unwrap();

        let mut seen = Vec::new();
        for _ in 0..8 {
            let report = world.step().unwrap();
            seen.extend(report.transitions.iter().map(|t| (t.from, t.to)));
        }
        assert_eq!(
            seen,
            vec![
                (TaskState::Queued, TaskState::Active),
                (TaskState::Active, TaskState::Completed),
            ]
        );
        assert_eq!(world.latest().position_of(unit), Some(TilePos::new(5, 6)));
        assert_eq!(world.planner().state(task), Some(TaskState::Completed));
    }

    fn task_states(world: &mut World, task: TaskId, steps: usize) -> Vec<TaskState> {
        let mut seen = Vec::new();
        for _ in 0..steps {
            let report = world.step().unwrap();
            seen.extend(report.transitions.iter().filter(|t| t.task == task).map(|t| t.to));
        }
        seen
    }

    #[test]
    fn goal_held_by_parked_unit_blocks_then_fails() {
        let config = SimConfig {
            task_stall_limit: 4,
            ..small_config()
        };
        let mut world = World::new(config).unwrap();
        let walker = world.place(unit_at(1, 1)).unwrap();
        world.place(unit_at(3, 1)).unwrap();
        let task = world.assign_task(walker, Goal::MoveTo(TilePos::new(3, 1))).unwrap();

        assert_eq!(
            task_states(&mut world, task, 30),
            vec![
                TaskState::Active,
                TaskState::Blocked,
                TaskState::Failed(FailureReason::Unreachable),
            ]
        );
        assert_eq!(world.spatial().position_of(walker), Some(TilePos::new(2, 1)));
        let mover = world.store().get::<Mover>(walker).unwrap();
        assert!(mover.path.is_empty());
        assert_eq!(mover.stalled_ticks, 0);
    }

    #[test]
    fn stalled_unit_routes_around_parked_unit() {
        let mut world = World::new(small_config()).unwrap();
        let walker = world.place(unit_at(1, 6)).unwrap();
        world.place(unit_at(3, 6)).unwrap();
        let task = world.assign_task(walker, Goal::MoveTo(TilePos::new(6, 6))).unwrap();

        assert_eq!(
            task_states(&mut world, task, 40),
            vec![TaskState::Active, TaskState::Completed]
        );
        assert_eq!(world.spatial().position_of(walker), Some(TilePos::new(6, 6)));
    }

    #[test]
    fn assign_task_requires_a_unit() {
        let mut world = World::new(small_config()).unwrap();
        let conveyor = conveyor_line(&mut world);
        assert_eq!(
            world.assign_task(conveyor.source, Goal::MoveTo(TilePos::new(0, 0))),
            Err(PlannerError::NotAUnit(conveyor.source))
        );
    }

    #[test]
    fn cancelled_task_clears_route() {
        let mut world = World::new(small_config()).unwrap();
        let unit = world.place(unit_at(1, 6)).unwrap();
        let task = world.assign_task(unit, Goal::MoveTo(TilePos::new(20, 6))).unwrap();
        for _ in 0..3 {
            world.step().unwrap();
        }
        assert_eq!(world.planner().state(task), Some(TaskState::Active));

        world.submit(Command::CancelTask(task));
        world.step().unwrap();
        let mover = world.store().get::<Mover>(unit).unwrap();
        assert!(mover.path.is_empty());
        assert_eq!(mover.task, None);
        for _ in 0..3 {
            world.step().unwrap();
        }
        // Reaped one tick after it finished; never reactivated.
        assert_eq!(world.planner().state(task), None);
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    #[test]
    fn command_history_follows_config() {
        let mut world = World::new(small_config()).unwrap();
        world.submit(Command::Place(Placement::new(wall(9, 9))));
        world.step().unwrap();
        assert!(world.command_history().is_empty());

        let config = SimConfig {
            command_history: 2,
            ..small_config()
        };
        let mut world = World::new(config).unwrap();
        for x in 0..3 {
            world.submit(Command::Place(Placement::new(wall(x, 9))));
            world.step().unwrap();
        }
        let ticks: Vec<Ticks> = world.command_history().iter().map(|(t, _)| *t).collect();
        assert_eq!(ticks, vec![2, 3]);
        assert_eq!(
            world.command_history()[1].1,
            Command::Place(Placement::new(wall(2, 9)))
        );
        world.clear_command_history();
        assert!(world.command_history().is_empty());
    }

    #[test]
    fn discarded_tick_leaves_no_command_history() {
        let config = SimConfig {
            command_history: 8,
            ..small_config()
        };
        let mut world = World::new(config).unwrap();
        world.register_handler(Arc::new(AlwaysPanic::default()));
        conveyor_line(&mut world);
        world.submit(Command::Place(Placement::new(wall(9, 9))));
        assert!(world.step().is_err());
        assert!(world.command_history().is_empty());
        assert_eq!(world.pending_commands().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Tick atomicity
    // -----------------------------------------------------------------------

    #[test]
    fn panicking_attempt_is_retried() {
        let mut world = World::new(small_config()).unwrap();
        let conveyor = conveyor_line(&mut world);
        world.register_handler(Arc::new(PanicOnce::new()));

        let report = world.step().unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.tick, 1);
        assert_eq!(amount(world.store(), conveyor.source, ore()), fixed(15.0));
        // Events of the failed attempt are gone, immediate placements kept.
        let created = report
            .events
            .iter()
            .filter(|e| e.kind() == EventKind::EntityCreated)
            .count();
        assert_eq!(created, 2);
    }

    #[test]
    fn failing_tick_is_discarded_and_clock_unchanged() {
        let mut world = World::new(small_config()).unwrap();
        let conveyor = conveyor_line(&mut world);
        world.tick().unwrap();
        let before = world.latest();
        let handler = Arc::new(AlwaysPanic::default());
        world.register_handler(handler.clone());
        world.submit(Command::Repair(conveyor.sink));

        match world.step() {
            Err(TickError::Discarded { tick, attempts, .. }) => {
                assert_eq!(tick, 2);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected discard, got {other:?}"),
        }
        assert_eq!(world.current_tick(), 1);
        assert!(Arc::ptr_eq(&world.latest(), &before));
        assert_eq!(world.pending_commands().len(), 1);
        assert_eq!(
            amount(world.store(), conveyor.source, ore()),
            amount(&before.store, conveyor.source, ore())
        );
        assert!(handler.calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    // -----------------------------------------------------------------------
    // Modules and persistence
    // -----------------------------------------------------------------------

    #[derive(Debug, Default)]
    struct TickTally {
        ticks: u64,
    }

    impl Module for TickTally {
        fn name(&self) -> &str {
            "tally"
        }

        fn on_tick(&mut self, _ctx: &ModuleContext<'_>) {
            self.ticks += 1;
        }

        fn serialize_state(&self) -> Vec<u8> {
            self.ticks.to_le_bytes().to_vec()
        }

        fn load_state(&mut self, data: &[u8]) -> Result<(), ModuleError> {
            self.ticks = match data.try_into() {
                Ok(bytes) => u64::from_le_bytes(bytes),
                Err(_) if data.is_empty() => 0,
                Err(_) => return Err(ModuleError::DeserializeFailed("tally".into())),
            };
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn module_state_travels_with_snapshots() {
        let mut world = World::new(small_config()).unwrap();
        world.register_module(Box::new(TickTally::default())).unwrap();
        for _ in 0..3 {
            world.tick().unwrap();
        }
        assert_eq!(world.module::<TickTally>().unwrap().ticks, 3);

        let snapshot = (*world.latest()).clone();
        let mut restored = World::from_snapshot(small_config(), snapshot).unwrap();
        restored.register_module(Box::new(TickTally::default())).unwrap();
        assert_eq!(restored.module::<TickTally>().unwrap().ticks, 3);
    }

    #[test]
    fn restored_world_continues_identically() {
        let mut world = World::new(small_config()).unwrap();
        conveyor_line(&mut world);
        let unit = world.place(unit_at(2, 8)).unwrap();
        world.assign_task(unit, Goal::MoveTo(TilePos::new(12, 8))).unwrap();
        for _ in 0..4 {
            world.tick().unwrap();
        }
        let bytes = serialize::serialize(&world.latest()).unwrap();
        let mut restored =
            World::from_snapshot(small_config(), serialize::deserialize(&bytes).unwrap()).unwrap();
        for _ in 0..6 {
            let a = world.step().unwrap();
            let b = restored.step().unwrap();
            assert_eq!(a.state_hash, b.state_hash, "diverged at tick {}", a.tick);
        }
    }
}

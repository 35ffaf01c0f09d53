//! Tick partitioning and batch execution.
//!
//! A tick is split into ordered batches. Batch 0 resolves the flow
//! network, one work unit per subgraph. Batches 1..=9 are the spatial
//! colour classes: every chunk gets colour `(cx mod 3) + 3 * (cy mod 3)`,
//! so two chunks of one colour are never adjacent and never share a
//! neighbouring chunk. Work units inside a batch run in parallel against
//! the batch-start state and their results are committed in entity-id
//! order before the next batch starts.

use std::collections::{BTreeMap, BTreeSet};

use crate::component::{Consumer, EntityFault, Inventory, MachineState, Mover, Position};
use crate::config::ConfigError;
use crate::event::{Event, EventLog};
use crate::fixed::{Fixed64, Ticks};
use crate::flow::{FlowBuffers, FlowNetwork, FlowResolution, NodeBuffer, Subgraph, SubgraphStatus};
use crate::handler::{
    capabilities_of, EntityScratch, HandlerContext, HandlerRegistry, TileClaims,
};
use crate::id::EntityId;
use crate::spatial::{ChunkCoord, SpatialIndex};
use crate::store::EntityStore;

/// Number of spatial colour classes.
pub const COLOR_COUNT: u8 = 9;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Chunks processed sequentially by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub chunks: Vec<ChunkCoord>,
    /// Ascending.
    pub entities: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    Flow { subgraphs: Vec<Subgraph> },
    Spatial { color: u8, units: Vec<WorkUnit> },
}

impl Batch {
    pub fn unit_count(&self) -> usize {
        match self {
            Batch::Flow { subgraphs } => subgraphs.len(),
            Batch::Spatial { units, .. } => units.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickPlan {
    pub batches: Vec<Batch>,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum EntityOutcome {
    Updated(EntityScratch),
    Faulted {
        id: EntityId,
        handler: String,
        fault: EntityFault,
    },
}

impl EntityOutcome {
    pub fn id(&self) -> EntityId {
        match self {
            EntityOutcome::Updated(scratch) => scratch.id,
            EntityOutcome::Faulted { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Flow(FlowResolution),
    /// Sorted by entity id.
    Spatial(Vec<EntityOutcome>),
}

/// What a commit changed that the tick report cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitSummary {
    pub faults: Vec<(EntityId, EntityFault)>,
    pub moved: u32,
}

// ---------------------------------------------------------------------------
// Partition cache
// ---------------------------------------------------------------------------

/// Entities with at least one capability, per chunk.
#[derive(Debug, Default)]
struct PartitionCache {
    chunks: BTreeMap<ChunkCoord, Vec<EntityId>>,
    dirty: BTreeSet<ChunkCoord>,
    stale: bool,
}

impl PartitionCache {
    fn refresh(&mut self, store: &EntityStore, spatial: &SpatialIndex) {
        if self.stale {
            self.chunks.clear();
            self.dirty = spatial.occupied_chunks().into_iter().collect();
            self.stale = false;
        }
        for chunk in std::mem::take(&mut self.dirty) {
            let active: Vec<EntityId> = spatial
                .members(chunk)
                .into_iter()
                .flatten()
                .copied()
                .filter(|id| !capabilities_of(store, *id).is_empty())
                .collect();
            if active.is_empty() {
                self.chunks.remove(&chunk);
            } else {
                self.chunks.insert(chunk, active);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Scheduler {
    handlers: HandlerRegistry,
    worker_count: usize,
    partition: PartitionCache,
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
}

impl Scheduler {
    pub fn new(worker_count: usize, handlers: HandlerRegistry) -> Result<Self, ConfigError> {
        let worker_count = worker_count.clamp(1, 64);
        #[cfg(feature = "parallel")]
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(|i| format!("cogwork-worker-{i}"))
            .build()
            .map_err(|e| ConfigError::WorkerPool(e.to_string()))?;
        Ok(Self {
            handlers,
            worker_count,
            partition: PartitionCache {
                stale: true,
                ..PartitionCache::default()
            },
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        self.partition.stale = true;
        &mut self.handlers
    }

    /// Forget every cached partition. Called after the live state is
    /// replaced wholesale.
    pub fn invalidate(&mut self) {
        self.partition.stale = true;
    }

    // -- Planning --

    /// Build the batch list for the coming tick. Drains the spatial
    /// index's change notifications to find dirty chunks.
    pub fn plan_tick(
        &mut self,
        store: &EntityStore,
        spatial: &mut SpatialIndex,
        flow: &mut FlowNetwork,
    ) -> TickPlan {
        for change in spatial.drain_changes() {
            self.partition.dirty.extend(change.from);
            self.partition.dirty.extend(change.to);
        }
        self.partition.refresh(store, spatial);
        flow.refresh();

        let mut batches = Vec::with_capacity(1 + COLOR_COUNT as usize);
        batches.push(Batch::Flow {
            subgraphs: flow.subgraphs().to_vec(),
        });
        for color in 0..COLOR_COUNT {
            batches.push(Batch::Spatial {
                color,
                units: self.units_for_color(color, spatial, flow),
            });
        }
        TickPlan { batches }
    }

    /// Group the chunks of one colour into work units, merging chunks that
    /// a connection links together.
    fn units_for_color(
        &self,
        color: u8,
        spatial: &SpatialIndex,
        flow: &FlowNetwork,
    ) -> Vec<WorkUnit> {
        let chunks: Vec<ChunkCoord> = self
            .partition
            .chunks
            .keys()
            .copied()
            .filter(|c| c.color() == color)
            .collect();
        if chunks.is_empty() {
            return Vec::new();
        }
        let index: BTreeMap<ChunkCoord, usize> =
            chunks.iter().enumerate().map(|(i, c)| (*c, i)).collect();
        let mut parent: Vec<usize> = (0..chunks.len()).collect();

        for conn in flow.connections() {
            let ends = (
                spatial.position_of(conn.from.entity),
                spatial.position_of(conn.to.entity),
            );
            let (Some(a), Some(b)) = ends else { continue };
            let (ca, cb) = (spatial.chunk_of(a), spatial.chunk_of(b));
            if ca == cb {
                continue;
            }
            if let (Some(&ia), Some(&ib)) = (index.get(&ca), index.get(&cb)) {
                let (ra, rb) = (find(&mut parent, ia), find(&mut parent, ib));
                if ra != rb {
                    parent[ra.max(rb)] = ra.min(rb);
                }
            }
        }

        let mut groups: BTreeMap<usize, WorkUnit> = BTreeMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let root = find(&mut parent, i);
            let unit = groups.entry(root).or_insert_with(|| WorkUnit {
                chunks: Vec::new(),
                entities: Vec::new(),
            });
            unit.chunks.push(*chunk);
            if let Some(members) = self.partition.chunks.get(chunk) {
                unit.entities.extend_from_slice(members);
            }
        }
        groups
            .into_values()
            .map(|mut unit| {
                unit.entities.sort_unstable();
                unit
            })
            .collect()
    }

    // -- Execution --

    /// Run every work unit of `batch` against the current state. Nothing
    /// is written; see [`commit`](Self::commit).
    pub fn execute_batch(
        &self,
        batch: &Batch,
        tick: Ticks,
        store: &EntityStore,
        spatial: &SpatialIndex,
        flow: &FlowNetwork,
        iteration_cap: u32,
    ) -> BatchOutcome {
        let _span = tracing::debug_span!("batch", tick, units = batch.unit_count()).entered();
        match batch {
            Batch::Flow { subgraphs } => {
                let buffers = flow_buffers(store, flow);
                let resolve = || flow.resolve_subgraphs(subgraphs, &buffers, iteration_cap);
                #[cfg(feature = "parallel")]
                let resolution = self.pool.install(resolve);
                #[cfg(not(feature = "parallel"))]
                let resolution = resolve();
                BatchOutcome::Flow(resolution)
            }
            Batch::Spatial { units, .. } => {
                let run = |unit: &WorkUnit| self.run_unit(unit, tick, store, spatial);
                #[cfg(feature = "parallel")]
                let per_unit: Vec<Vec<EntityOutcome>> = self.pool.install(|| {
                    use rayon::prelude::*;
                    units.par_iter().map(run).collect()
                });
                #[cfg(not(feature = "parallel"))]
                let per_unit: Vec<Vec<EntityOutcome>> = units.iter().map(run).collect();

                let mut outcomes: Vec<EntityOutcome> = per_unit.into_iter().flatten().collect();
                outcomes.sort_by_key(EntityOutcome::id);
                BatchOutcome::Spatial(outcomes)
            }
        }
    }

    fn run_unit(
        &self,
        unit: &WorkUnit,
        tick: Ticks,
        store: &EntityStore,
        spatial: &SpatialIndex,
    ) -> Vec<EntityOutcome> {
        let mut claims = TileClaims::new();
        let mut outcomes = Vec::with_capacity(unit.entities.len());
        for &id in &unit.entities {
            if !store.is_live(id) || store.is_errored(id) {
                continue;
            }
            let caps = capabilities_of(store, id);
            let mut scratch = EntityScratch::load(store, id);
            let mut ctx = HandlerContext {
                tick,
                store,
                spatial,
                claims: &mut claims,
            };
            let mut failed = None;
            for handler in self.handlers.for_capabilities(&caps) {
                if let Err(fault) = handler.update(&mut ctx, &mut scratch) {
                    failed = Some((handler.name().to_string(), fault));
                    break;
                }
            }
            outcomes.push(match failed {
                Some((handler, fault)) => EntityOutcome::Faulted { id, handler, fault },
                None => EntityOutcome::Updated(scratch),
            });
        }
        outcomes
    }

    // -- Commit --

    /// Write a batch outcome into the live state.
    pub fn commit(
        &self,
        outcome: &BatchOutcome,
        tick: Ticks,
        store: &mut EntityStore,
        spatial: &mut SpatialIndex,
        flow: &FlowNetwork,
        events: &mut EventLog,
    ) -> CommitSummary {
        let mut summary = CommitSummary::default();
        match outcome {
            BatchOutcome::Flow(resolution) => {
                commit_flow(resolution, store, flow);
                for report in &resolution.subgraphs {
                    if let SubgraphStatus::Unsatisfied(fault) = report.status {
                        events.emit(Event::FlowUnsatisfied {
                            resource: report.resource,
                            fault,
                            tick,
                        });
                    }
                }
            }
            BatchOutcome::Spatial(outcomes) => {
                for outcome in outcomes {
                    match outcome {
                        EntityOutcome::Faulted { id, handler, fault } => {
                            tracing::warn!(entity = %id, handler = %handler, %fault, "entity errored");
                            if store.set_fault(*id, fault.clone()).is_ok() {
                                events.emit(Event::EntityErrored {
                                    entity: *id,
                                    fault: fault.clone(),
                                    tick,
                                });
                                summary.faults.push((*id, fault.clone()));
                            }
                        }
                        EntityOutcome::Updated(scratch) => {
                            if commit_scratch(scratch, tick, store, spatial, events) {
                                summary.moved += 1;
                            }
                        }
                    }
                }
            }
        }
        summary
    }
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Offer and request of every connection endpoint.
///
/// A consumer only asks for what its next drain still lacks; everything
/// else asks for its free space. Errored entities neither give nor take.
pub fn flow_buffers(store: &EntityStore, flow: &FlowNetwork) -> FlowBuffers {
    let mut buffers = FlowBuffers::new();
    for conn in flow.connections() {
        for entity in [conn.from.entity, conn.to.entity] {
            let key = (entity, conn.resource);
            if buffers.contains_key(&key) {
                continue;
            }
            if store.is_errored(entity) {
                buffers.insert(key, NodeBuffer::idle());
                continue;
            }
            let Some(buffer) = store
                .get::<Inventory>(entity)
                .ok()
                .and_then(|inv| inv.buffer(conn.resource))
            else {
                continue;
            };
            if !buffer.is_valid() {
                buffers.insert(key, NodeBuffer::corrupt());
                continue;
            }
            let mut request = buffer.headroom();
            if let Ok(consumer) = store.get::<Consumer>(entity) {
                if consumer.resource == conn.resource {
                    let shortfall = (consumer.rate - buffer.amount).max(Fixed64::ZERO);
                    request = request.min(shortfall);
                }
            }
            buffers.insert(key, NodeBuffer::new(buffer.amount, request));
        }
    }
    buffers
}

fn commit_flow(resolution: &FlowResolution, store: &mut EntityStore, flow: &FlowNetwork) {
    for (id, amount) in &resolution.transfers {
        if *amount <= Fixed64::ZERO {
            continue;
        }
        let Some(conn) = flow.connection(*id) else {
            continue;
        };
        if let Ok(inv) = store.get_mut::<Inventory>(conn.from.entity) {
            inv.withdraw(conn.resource, *amount);
        }
        if let Ok(inv) = store.get_mut::<Inventory>(conn.to.entity) {
            inv.deposit(conn.resource, *amount);
        }
    }
}

/// Returns whether the entity changed tile.
///
/// A step that cannot be applied leaves the entity where it was with the
/// tile back at the head of its route, counted as a stalled tick. The rest
/// of the scratch is still committed.
fn commit_scratch(
    scratch: &EntityScratch,
    tick: Ticks,
    store: &mut EntityStore,
    spatial: &mut SpatialIndex,
    events: &mut EventLog,
) -> bool {
    let id = scratch.id;
    let mut moved = false;
    let mut mover = scratch.mover.clone();
    if let Some(to) = scratch.position {
        if spatial.position_of(id).is_some_and(|from| from != to) {
            match spatial.relocate(id, to) {
                Ok(()) => {
                    let _ = store.set(id, Position(to));
                    moved = true;
                }
                Err(err) => {
                    tracing::debug!(entity = %id, %err, "step dropped, unit stays put");
                    if let Some(m) = mover.as_mut() {
                        m.path.insert(0, to);
                        m.cooldown = 0;
                        m.stalled_ticks = m.stalled_ticks.saturating_add(1);
                    }
                }
            }
        }
    }
    if let Some(inv) = &scratch.inventory {
        let _ = store.set::<Inventory>(id, inv.clone());
    }
    if let Some(mover) = mover {
        let _ = store.set::<Mover>(id, mover);
    }
    if let Some(mut state) = scratch.machine_state.clone() {
        if let Some(status) = scratch.status {
            if status != state.status {
                events.emit(Event::MachineStatusChanged {
                    entity: id,
                    from: state.status,
                    to: status,
                    tick,
                });
                state.status = status;
            }
        }
        let _ = store.set::<MachineState>(id, state);
    }
    moved
}

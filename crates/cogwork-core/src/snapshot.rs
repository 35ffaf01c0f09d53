//! Immutable per-tick views of the world.
//!
//! A [`TickSnapshot`] is published once per committed tick and shared as
//! `Arc<TickSnapshot>`. Readers on other threads keep their `Arc` for as
//! long as they like; the next tick never touches it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::component::{EntityKind, Mover, Position};
use crate::fixed::Ticks;
use crate::flow::{Connection, FlowError, FlowNetwork};
use crate::id::{EntityId, TaskId};
use crate::planner::{PlanView, Planner, Task};
use crate::spatial::{ChunkCoord, SpatialError, SpatialIndex, TilePos};
use crate::store::EntityStore;

/// Size of the world and its chunk grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldExtent {
    pub width: u32,
    pub height: u32,
    pub chunk_size: u32,
}

impl WorldExtent {
    pub fn contains(&self, tile: TilePos) -> bool {
        tile.x >= 0
            && tile.y >= 0
            && (tile.x as u32) < self.width
            && (tile.y as u32) < self.height
    }
}

/// Why a snapshot could not be turned back into live state.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("spatial index rebuild failed: {0}")]
    Spatial(#[from] SpatialError),
    #[error("connection rebuild failed: {0}")]
    Flow(#[from] FlowError),
}

/// Everything needed to continue simulating from a snapshot.
#[derive(Debug)]
pub struct LiveState {
    pub store: EntityStore,
    pub spatial: SpatialIndex,
    pub flow: FlowNetwork,
    pub planner: Planner,
}

// ---------------------------------------------------------------------------
// TickSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSnapshot {
    pub tick: Ticks,
    pub extent: WorldExtent,
    pub store: EntityStore,
    pub next_connection_id: u64,
    /// Ascending by id.
    pub connections: Vec<Connection>,
    pub planner: Planner,
    pub seeded_chunks: BTreeSet<ChunkCoord>,
    /// Module state keyed by module name.
    pub extensions: BTreeMap<String, Vec<u8>>,
    /// Tiles held by machines and structures. Derived from `store`.
    #[serde(skip)]
    pub(crate) blocked: HashSet<TilePos>,
    /// Unit positions by tile. Derived from `store`.
    #[serde(skip)]
    pub(crate) units: HashMap<TilePos, EntityId>,
}

impl TickSnapshot {
    /// Capture live state. The store is compacted so equal worlds give
    /// equal bytes.
    pub fn capture(
        tick: Ticks,
        extent: WorldExtent,
        store: &EntityStore,
        spatial: &SpatialIndex,
        flow: &FlowNetwork,
        planner: &Planner,
        extensions: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        let mut store = store.clone();
        store.compact();
        let mut snapshot = Self {
            tick,
            extent,
            store,
            next_connection_id: flow.next_id(),
            connections: flow.connections().cloned().collect(),
            planner: planner.clone(),
            seeded_chunks: spatial.seeded_chunks().clone(),
            extensions,
            blocked: HashSet::new(),
            units: HashMap::new(),
        };
        snapshot.rebuild_derived();
        snapshot
    }

    /// Recompute fields that are not persisted.
    pub fn rebuild_derived(&mut self) {
        self.blocked = self
            .store
            .iter_of_type::<Position>()
            .filter(|(id, _)| {
                self.store
                    .kind(*id)
                    .is_ok_and(EntityKind::blocks_paths)
            })
            .map(|(_, pos)| pos.0)
            .collect();
        self.units = self
            .store
            .iter_of_type::<Position>()
            .filter(|(id, _)| matches!(self.store.kind(*id), Ok(EntityKind::Unit)))
            .map(|(id, pos)| (pos.0, id))
            .collect();
    }

    /// Rebuild mutable live state from this snapshot.
    pub fn restore(&self) -> Result<LiveState, RestoreError> {
        let mut spatial =
            SpatialIndex::new(self.extent.chunk_size, self.extent.width, self.extent.height);
        for (id, pos) in self.store.iter_of_type::<Position>() {
            spatial.insert(id, pos.0)?;
        }
        spatial.set_seeded(self.seeded_chunks.clone());
        spatial.drain_changes();
        let flow =
            FlowNetwork::from_connections(self.next_connection_id, self.connections.iter().cloned())?;
        Ok(LiveState {
            store: self.store.clone(),
            spatial,
            flow,
            planner: self.planner.clone(),
        })
    }

    pub fn position_of(&self, entity: EntityId) -> Option<TilePos> {
        self.store.get::<Position>(entity).ok().map(|p| p.0)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.planner.task(id)
    }

    pub fn is_blocked(&self, tile: TilePos) -> bool {
        self.blocked.contains(&tile)
    }
}

impl PlanView for TickSnapshot {
    fn unit_position(&self, unit: EntityId) -> Option<TilePos> {
        match self.store.kind(unit) {
            Ok(EntityKind::Unit) => self.position_of(unit),
            _ => None,
        }
    }

    fn entity_position(&self, entity: EntityId) -> Option<TilePos> {
        self.position_of(entity)
    }

    fn is_passable(&self, tile: TilePos) -> bool {
        self.extent.contains(tile) && !self.is_blocked(tile)
    }

    fn stalled_ticks(&self, unit: EntityId) -> u32 {
        self.store
            .get::<Mover>(unit)
            .map_or(0, |m| m.stalled_ticks)
    }

    fn unit_at(&self, tile: TilePos) -> Option<EntityId> {
        self.units.get(&tile).copied()
    }
}

// ---------------------------------------------------------------------------
// History and shared handle
// ---------------------------------------------------------------------------

/// The most recent committed snapshots, oldest first.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    entries: VecDeque<Arc<TickSnapshot>>,
    capacity: usize,
}

impl SnapshotHistory {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, snapshot: Arc<TickSnapshot>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    pub fn latest(&self) -> Option<&Arc<TickSnapshot>> {
        self.entries.back()
    }

    pub fn at_tick(&self, tick: Ticks) -> Option<&Arc<TickSnapshot>> {
        self.entries.iter().find(|s| s.tick == tick)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TickSnapshot>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Clonable, thread-safe access to the latest snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<TickSnapshot>>>,
}

impl SnapshotHandle {
    pub fn new(snapshot: Arc<TickSnapshot>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn latest(&self) -> Arc<TickSnapshot> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub(crate) fn publish(&self, snapshot: Arc<TickSnapshot>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

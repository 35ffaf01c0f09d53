//! Component records attached to entities.
//!
//! Entities are tagged component sets rather than a type hierarchy: what an
//! entity *does* each tick follows from which capability components it
//! carries ([`Producer`], [`Consumer`], [`Mover`]), and the scheduler routes
//! it to the matching handlers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fixed::Fixed64;
use crate::id::{ResourceTypeId, TaskId};
use crate::spatial::TilePos;

// ---------------------------------------------------------------------------
// Entity metadata
// ---------------------------------------------------------------------------

/// Broad category of an entity. Machines and structures block tiles for
/// path planning; units move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Machine,
    Structure,
    Unit,
}

impl EntityKind {
    /// Whether entities of this kind block unit paths.
    pub fn blocks_paths(self) -> bool {
        !matches!(self, EntityKind::Unit)
    }
}

/// Per-tick behaviours an entity can take part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    Producer,
    Consumer,
    Mover,
}

/// Why an entity was frozen during a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum EntityFault {
    #[error("missing {0} component")]
    MissingComponent(String),
    #[error("no buffer for resource {0:?}")]
    MissingBuffer(ResourceTypeId),
    #[error("buffer for {resource:?} is corrupt: {detail}")]
    CorruptBuffer {
        resource: ResourceTypeId,
        detail: String,
    },
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("handler fault: {0}")]
    Handler(String),
}

/// Store-level bookkeeping for one live entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    /// Tick during whose mutation phase the entity was created.
    pub created_tick: u64,
    /// Set when a handler failed; the entity is frozen until repaired.
    pub fault: Option<EntityFault>,
}

impl EntityRecord {
    pub fn is_errored(&self) -> bool {
        self.fault.is_some()
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Where an entity sits on the tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position(pub TilePos);

/// A single resource buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    pub amount: Fixed64,
    pub capacity: Fixed64,
}

impl Buffer {
    pub fn empty(capacity: Fixed64) -> Self {
        Self {
            amount: Fixed64::ZERO,
            capacity,
        }
    }

    /// Space left before the buffer is full. Zero for corrupt buffers.
    pub fn headroom(&self) -> Fixed64 {
        (self.capacity - self.amount).max(Fixed64::ZERO)
    }

    /// A buffer is valid when `0 <= amount <= capacity`.
    pub fn is_valid(&self) -> bool {
        self.capacity >= Fixed64::ZERO
            && self.amount >= Fixed64::ZERO
            && self.amount <= self.capacity
    }
}

/// Per-resource buffers held by an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub buffers: BTreeMap<ResourceTypeId, Buffer>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: add an empty buffer for `resource`.
    pub fn with_buffer(mut self, resource: ResourceTypeId, capacity: Fixed64) -> Self {
        self.buffers.insert(resource, Buffer::empty(capacity));
        self
    }

    pub fn buffer(&self, resource: ResourceTypeId) -> Option<&Buffer> {
        self.buffers.get(&resource)
    }

    pub fn buffer_mut(&mut self, resource: ResourceTypeId) -> Option<&mut Buffer> {
        self.buffers.get_mut(&resource)
    }

    /// Amount held for `resource`, zero when there is no buffer.
    pub fn amount(&self, resource: ResourceTypeId) -> Fixed64 {
        self.buffers
            .get(&resource)
            .map(|b| b.amount)
            .unwrap_or(Fixed64::ZERO)
    }

    /// Add up to `amount`, clamped to capacity. Returns what was stored.
    pub fn deposit(&mut self, resource: ResourceTypeId, amount: Fixed64) -> Fixed64 {
        let Some(buffer) = self.buffers.get_mut(&resource) else {
            return Fixed64::ZERO;
        };
        let stored = amount.min(buffer.headroom()).max(Fixed64::ZERO);
        buffer.amount += stored;
        stored
    }

    /// Remove up to `amount`. Returns what was taken.
    pub fn withdraw(&mut self, resource: ResourceTypeId, amount: Fixed64) -> Fixed64 {
        let Some(buffer) = self.buffers.get_mut(&resource) else {
            return Fixed64::ZERO;
        };
        let taken = amount.min(buffer.amount).max(Fixed64::ZERO);
        buffer.amount -= taken;
        taken
    }
}

/// An ingredient a producer draws on for every unit it emits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub resource: ResourceTypeId,
    /// Ingredient consumed per unit of output.
    pub ratio: Fixed64,
}

/// Emits `rate` of `resource` per tick into the entity's own buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Producer {
    pub resource: ResourceTypeId,
    pub rate: Fixed64,
    #[serde(default)]
    pub requires: Option<Ingredient>,
}

/// Drains up to `rate` of `resource` per tick from the entity's own buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Consumer {
    pub resource: ResourceTypeId,
    pub rate: Fixed64,
}

/// Unit locomotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mover {
    /// Ticks needed per tile step (minimum 1).
    pub ticks_per_step: u32,
    /// Ticks left before the next step is allowed.
    pub cooldown: u32,
    /// Remaining planned route, next tile first.
    pub path: Vec<TilePos>,
    /// Weak back-reference to the task being worked on.
    pub task: Option<TaskId>,
    /// Consecutive ticks the next step was occupied.
    pub stalled_ticks: u32,
}

impl Mover {
    pub fn new(ticks_per_step: u32) -> Self {
        Self {
            ticks_per_step: ticks_per_step.max(1),
            cooldown: 0,
            path: Vec::new(),
            task: None,
            stalled_ticks: 0,
        }
    }
}

/// Runtime status of a machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    #[default]
    Idle,
    Running,
    /// Not enough input (ingredient or consumed resource).
    Starved,
    /// Output buffer full.
    OutputBlocked,
}

/// Runtime state and lifetime counters of a machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub status: MachineStatus,
    pub produced_total: Fixed64,
    pub consumed_total: Fixed64,
}

// ---------------------------------------------------------------------------
// ComponentSet
// ---------------------------------------------------------------------------

/// The full set of components an entity is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSet {
    pub kind: EntityKind,
    pub position: Option<Position>,
    pub inventory: Option<Inventory>,
    pub producer: Option<Producer>,
    pub consumer: Option<Consumer>,
    pub mover: Option<Mover>,
    pub machine_state: Option<MachineState>,
}

impl ComponentSet {
    /// An empty set of the given kind.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            position: None,
            inventory: None,
            producer: None,
            consumer: None,
            mover: None,
            machine_state: None,
        }
    }

    /// A machine at `pos` with an empty inventory and idle state.
    pub fn machine(pos: TilePos) -> Self {
        Self {
            position: Some(Position(pos)),
            inventory: Some(Inventory::new()),
            machine_state: Some(MachineState::default()),
            ..Self::new(EntityKind::Machine)
        }
    }

    /// A passive structure (wall, chest) at `pos`.
    pub fn structure(pos: TilePos) -> Self {
        Self {
            position: Some(Position(pos)),
            ..Self::new(EntityKind::Structure)
        }
    }

    /// A unit at `pos` moving one tile every `ticks_per_step` ticks.
    pub fn unit(pos: TilePos, ticks_per_step: u32) -> Self {
        Self {
            position: Some(Position(pos)),
            mover: Some(Mover::new(ticks_per_step)),
            ..Self::new(EntityKind::Unit)
        }
    }

    pub fn with_buffer(mut self, resource: ResourceTypeId, capacity: Fixed64) -> Self {
        let inventory = self.inventory.take().unwrap_or_default();
        self.inventory = Some(inventory.with_buffer(resource, capacity));
        self
    }

    pub fn with_producer(mut self, producer: Producer) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn with_consumer(mut self, consumer: Consumer) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Capabilities implied by the attached components, in handler order.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.consumer.is_some() {
            caps.push(Capability::Consumer);
        }
        if self.producer.is_some() {
            caps.push(Capability::Producer);
        }
        if self.mover.is_some() {
            caps.push(Capability::Mover);
        }
        caps
    }
}

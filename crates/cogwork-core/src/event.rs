//! Per-tick event log.
//!
//! Events are recorded while a tick runs and handed back in the
//! [`TickReport`](crate::world::TickReport) once it commits. A discarded
//! tick drops its events with it. Kinds can be suppressed so that they are
//! never recorded.

use crate::component::{EntityFault, EntityKind, MachineStatus};
use crate::fixed::Ticks;
use crate::flow::FlowFault;
use crate::id::{ConnectionId, EntityId, ResourceTypeId, TaskId};
use crate::planner::TaskState;
use crate::spatial::ChunkCoord;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // -- Lifecycle --
    EntityCreated {
        entity: EntityId,
        kind: EntityKind,
        tick: Ticks,
    },
    EntityDestroyed {
        entity: EntityId,
        tick: Ticks,
    },
    PlacementRejected {
        reason: String,
        tick: Ticks,
    },
    ChunkSeeded {
        chunk: ChunkCoord,
        placed: u32,
        tick: Ticks,
    },
    ConnectionAdded {
        connection: ConnectionId,
        tick: Ticks,
    },
    ConnectionRemoved {
        connection: ConnectionId,
        tick: Ticks,
    },

    // -- Faults --
    EntityErrored {
        entity: EntityId,
        fault: EntityFault,
        tick: Ticks,
    },
    EntityRepaired {
        entity: EntityId,
        tick: Ticks,
    },
    FlowUnsatisfied {
        resource: ResourceTypeId,
        fault: FlowFault,
        tick: Ticks,
    },

    // -- Machines and units --
    MachineStatusChanged {
        entity: EntityId,
        from: MachineStatus,
        to: MachineStatus,
        tick: Ticks,
    },
    TaskStateChanged {
        task: TaskId,
        unit: EntityId,
        from: TaskState,
        to: TaskState,
        tick: Ticks,
    },
}

/// Discriminant tag for suppression and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EntityCreated,
    EntityDestroyed,
    PlacementRejected,
    ChunkSeeded,
    ConnectionAdded,
    ConnectionRemoved,
    EntityErrored,
    EntityRepaired,
    FlowUnsatisfied,
    MachineStatusChanged,
    TaskStateChanged,
}

const EVENT_KIND_COUNT: usize = 11;

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::EntityCreated { .. } => EventKind::EntityCreated,
            Event::EntityDestroyed { .. } => EventKind::EntityDestroyed,
            Event::PlacementRejected { .. } => EventKind::PlacementRejected,
            Event::ChunkSeeded { .. } => EventKind::ChunkSeeded,
            Event::ConnectionAdded { .. } => EventKind::ConnectionAdded,
            Event::ConnectionRemoved { .. } => EventKind::ConnectionRemoved,
            Event::EntityErrored { .. } => EventKind::EntityErrored,
            Event::EntityRepaired { .. } => EventKind::EntityRepaired,
            Event::FlowUnsatisfied { .. } => EventKind::FlowUnsatisfied,
            Event::MachineStatusChanged { .. } => EventKind::MachineStatusChanged,
            Event::TaskStateChanged { .. } => EventKind::TaskStateChanged,
        }
    }

    pub fn tick(&self) -> Ticks {
        match self {
            Event::EntityCreated { tick, .. }
            | Event::EntityDestroyed { tick, .. }
            | Event::PlacementRejected { tick, .. }
            | Event::ChunkSeeded { tick, .. }
            | Event::ConnectionAdded { tick, .. }
            | Event::ConnectionRemoved { tick, .. }
            | Event::EntityErrored { tick, .. }
            | Event::EntityRepaired { tick, .. }
            | Event::FlowUnsatisfied { tick, .. }
            | Event::MachineStatusChanged { tick, .. }
            | Event::TaskStateChanged { tick, .. } => *tick,
        }
    }
}

impl EventKind {
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<Event>,
    suppressed: [bool; EVENT_KIND_COUNT],
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
    }

    pub fn unsuppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = false;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    pub fn emit(&mut self, event: Event) {
        if !self.is_suppressed(event.kind()) {
            self.events.push(event);
        }
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Drop everything recorded since the last drain.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Drop everything recorded after the first `len` events.
    pub fn truncate(&mut self, len: usize) {
        self.events.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a unit task owned by the planner.
    ///
    /// Units hold these as weak back-references: once the planner reaps a
    /// task its key goes stale and lookups return `None`.
    pub struct TaskId;
}

/// Identifies a simulated entity (machine, structure, or unit).
///
/// Allocated monotonically by the entity store and never reused, so a
/// destroyed id stays tombstoned for the lifetime of the world and across
/// save/load.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityId(pub u64);

/// Identifies a connection (conveyor, pipe, power line) in the flow network.
///
/// Ascending `ConnectionId` order is the stable tie-break order for flow
/// resolution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConnectionId(pub u64);

/// Identifies a resource type (iron ore, water, power, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ResourceTypeId(pub u32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

//! Deterministic replay and desync detection.
//!
//! A [`ReplayLog`] holds a starting snapshot plus every input applied after
//! it, grouped by the tick they fed into, and the state hash each tick
//! committed with. [`ReplayLog::verify`] rebuilds a world from the start,
//! feeds it the same inputs and reports the first tick whose hash differs.

use serde::{Deserialize, Serialize};

use crate::clock::StateHash;
use crate::command_queue::Command;
use crate::config::SimConfig;
use crate::fixed::Ticks;
use crate::id::EntityId;
use crate::placement::Placement;
use crate::planner::Goal;
use crate::serialize::{self, DeserializeError, SerializeError};
use crate::spatial::TileRect;
use crate::world::{TickError, World, WorldError};

/// An immediate operation applied between ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplayInput {
    Place(Placement),
    AssignTask { unit: EntityId, goal: Goal },
    TouchRegion(TileRect),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayTick {
    pub tick: Ticks,
    /// Applied before the tick started, in order.
    pub inputs: Vec<ReplayInput>,
    /// Drained in the tick's pre-tick slot.
    pub commands: Vec<Command>,
    pub hash: StateHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence {
    pub tick: Ticks,
    pub expected: StateHash,
    pub actual: StateHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayResult {
    /// Every recorded tick reproduced its hash.
    Match { ticks: usize },
    Diverged(Divergence),
}

impl ReplayResult {
    pub fn is_match(&self) -> bool {
        matches!(self, ReplayResult::Match { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("live state has changes that are not committed yet")]
    Uncommitted,
    #[error("replay log is malformed: {0}")]
    Malformed(String),
    #[error("replayed tick number {actual} does not match recorded tick {expected}")]
    TickMismatch { expected: Ticks, actual: Ticks },
    #[error(transparent)]
    Encode(#[from] SerializeError),
    #[error(transparent)]
    Decode(#[from] DeserializeError),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    Tick(#[from] TickError),
}

// ---------------------------------------------------------------------------
// ReplayLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayLog {
    /// Serialized starting snapshot.
    start: Vec<u8>,
    start_tick: Ticks,
    ticks: Vec<ReplayTick>,
    /// Inputs noted since the last recorded tick.
    #[serde(default)]
    pending: Vec<ReplayInput>,
}

impl ReplayLog {
    pub fn begin(start: &crate::snapshot::TickSnapshot) -> Result<Self, SerializeError> {
        Ok(Self {
            start: serialize::serialize(start)?,
            start_tick: start.tick,
            ticks: Vec::new(),
            pending: Vec::new(),
        })
    }

    pub fn note(&mut self, input: ReplayInput) {
        self.pending.push(input);
    }

    /// Close `tick` with the commands it drained and the hash it
    /// committed with.
    pub fn record(&mut self, tick: Ticks, commands: Vec<Command>, hash: StateHash) {
        self.ticks.push(ReplayTick {
            tick,
            inputs: std::mem::take(&mut self.pending),
            commands,
            hash,
        });
    }

    pub fn start_tick(&self) -> Ticks {
        self.start_tick
    }

    pub fn ticks(&self) -> &[ReplayTick] {
        &self.ticks
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializeError> {
        bitcode::serialize(self).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ReplayError> {
        bitcode::deserialize(data).map_err(|e| ReplayError::Malformed(e.to_string()))
    }

    /// Rebuild the starting world with default handlers and no modules.
    pub fn start_world(&self, config: SimConfig) -> Result<World, ReplayError> {
        let snapshot = serialize::deserialize(&self.start)?;
        Ok(World::from_snapshot(config, snapshot)?)
    }

    pub fn verify(&self, config: SimConfig) -> Result<ReplayResult, ReplayError> {
        let mut world = self.start_world(config)?;
        self.verify_on(&mut world)
    }

    /// Replay onto `world`, which must be at the starting snapshot with the
    /// same handlers, generator and modules as the recorded one.
    pub fn verify_on(&self, world: &mut World) -> Result<ReplayResult, ReplayError> {
        for (checked, entry) in self.ticks.iter().enumerate() {
            for input in &entry.inputs {
                // Rejections are part of the recording; they replay the same.
                match input {
                    ReplayInput::Place(placement) => {
                        let _ = world.place(placement.clone());
                    }
                    ReplayInput::AssignTask { unit, goal } => {
                        let _ = world.assign_task(*unit, *goal);
                    }
                    ReplayInput::TouchRegion(bounds) => world.touch_region(*bounds),
                }
            }
            world.submit_batch(entry.commands.iter().cloned());
            let report = world.step()?;
            if report.tick != entry.tick {
                return Err(ReplayError::TickMismatch {
                    expected: entry.tick,
                    actual: report.tick,
                });
            }
            if report.state_hash != entry.hash {
                tracing::warn!(
                    tick = entry.tick,
                    expected = %entry.hash,
                    actual = %report.state_hash,
                    checked,
                    "replay diverged"
                );
                return Ok(ReplayResult::Diverged(Divergence {
                    tick: entry.tick,
                    expected: entry.hash,
                    actual: report.state_hash,
                }));
            }
        }
        Ok(ReplayResult::Match {
            ticks: self.ticks.len(),
        })
    }
}

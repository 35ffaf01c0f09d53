//! Lazy chunk seeding.
//!
//! The world asks a [`ChunkGenerator`] for a chunk's initial contents the
//! first time the spatial index touches it. Generators must be pure
//! functions of the chunk coordinate so that replays and reloads seed the
//! same content.

use crate::event::{Event, EventLog};
use crate::fixed::Ticks;
use crate::flow::FlowNetwork;
use crate::id::EntityId;
use crate::placement::{self, Placement, ValidationError};
use crate::spatial::{ChunkCoord, SpatialIndex, TileRect};
use crate::store::EntityStore;

/// Initial contents of one chunk. Links may point at earlier seeds of the
/// same chunk through [`LinkTarget::Seed`](crate::placement::LinkTarget::Seed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkSeed {
    pub placements: Vec<Placement>,
}

impl ChunkSeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, placement: Placement) -> Self {
        self.placements.push(placement);
        self
    }
}

pub trait ChunkGenerator: Send + Sync {
    fn generate_chunk(&self, coord: ChunkCoord, bounds: TileRect) -> ChunkSeed;
}

/// Generates nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyGenerator;

impl ChunkGenerator for EmptyGenerator {
    fn generate_chunk(&self, _coord: ChunkCoord, _bounds: TileRect) -> ChunkSeed {
        ChunkSeed::default()
    }
}

impl<F> ChunkGenerator for F
where
    F: Fn(ChunkCoord, TileRect) -> ChunkSeed + Send + Sync,
{
    fn generate_chunk(&self, coord: ChunkCoord, bounds: TileRect) -> ChunkSeed {
        self(coord, bounds)
    }
}

/// Stands in for a rejected seed so later links to it fail validation.
const REJECTED: EntityId = EntityId(u64::MAX);

/// Generate `coord` and place its contents. Placements outside the chunk
/// or failing validation are rejected one by one. Returns how many were
/// placed.
pub fn seed_chunk(
    generator: &dyn ChunkGenerator,
    coord: ChunkCoord,
    tick: Ticks,
    store: &mut EntityStore,
    spatial: &mut SpatialIndex,
    flow: &mut FlowNetwork,
    events: &mut EventLog,
) -> u32 {
    let bounds = spatial.chunk_bounds(coord);
    let seed = generator.generate_chunk(coord, bounds);
    let mut seeds: Vec<EntityId> = Vec::with_capacity(seed.placements.len());
    let mut placed = 0;

    for placement in seed.placements {
        let inside = placement
            .components
            .position
            .is_some_and(|p| bounds.contains(p.0));
        let kind = placement.components.kind;
        let result = if inside {
            placement::apply(placement, store, spatial, flow, &seeds)
        } else {
            Err(ValidationError::Components(format!(
                "seed outside chunk ({}, {})",
                coord.cx, coord.cy
            )))
        };
        match result {
            Ok((id, connections)) => {
                events.emit(Event::EntityCreated {
                    entity: id,
                    kind,
                    tick,
                });
                for connection in connections {
                    events.emit(Event::ConnectionAdded { connection, tick });
                }
                seeds.push(id);
                placed += 1;
            }
            Err(err) => {
                tracing::debug!(cx = coord.cx, cy = coord.cy, %err, "seed placement rejected");
                events.emit(Event::PlacementRejected {
                    reason: err.to_string(),
                    tick,
                });
                seeds.push(REJECTED);
            }
        }
    }

    events.emit(Event::ChunkSeeded {
        chunk: coord,
        placed,
        tick,
    });
    placed
}

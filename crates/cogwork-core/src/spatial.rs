//! Chunked spatial index over the tile grid.
//!
//! The world is a fixed `width x height` tile extent cut into square chunks
//! of `chunk_size` tiles. Each chunk owns the set of entities standing in
//! it, and each tile holds at most one entity. Entities only change chunk
//! through [`SpatialIndex::relocate`], which records a [`ChunkChange`] so the
//! scheduler can re-batch just the affected chunks.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::id::EntityId;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A tile on the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TilePos {
    pub x: i32,
    pub y: i32,
}

impl TilePos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn manhattan_distance(&self, other: &TilePos) -> u32 {
        (self.x - other.x).unsigned_abs() + (self.y - other.y).unsigned_abs()
    }

    pub fn chebyshev_distance(&self, other: &TilePos) -> u32 {
        (self.x - other.x)
            .unsigned_abs()
            .max((self.y - other.y).unsigned_abs())
    }

    pub fn offset(&self, direction: Direction) -> TilePos {
        let (dx, dy) = direction.offset();
        TilePos::new(self.x + dx, self.y + dy)
    }

    /// The four orthogonal neighbours, in [`Direction::all`] order.
    pub fn neighbors_4(&self) -> [TilePos; 4] {
        Direction::all().map(|d| self.offset(d))
    }
}

/// Cardinal directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    East,
    South,
    West,
}

impl Direction {
    pub fn all() -> [Direction; 4] {
        [
            Direction::North,
            Direction::East,
            Direction::South,
            Direction::West,
        ]
    }

    pub fn offset(&self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::East => (1, 0),
            Direction::South => (0, 1),
            Direction::West => (-1, 0),
        }
    }
}

/// Chunk coordinates (tile coordinates divided by the chunk size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub cx: i32,
    pub cy: i32,
}

impl ChunkCoord {
    pub const fn new(cx: i32, cy: i32) -> Self {
        Self { cx, cy }
    }

    /// Colour class in `0..9`. Two distinct chunks of the same colour are
    /// at least three chunks apart on some axis, so they are never adjacent
    /// and never share a neighbouring chunk.
    pub fn color(&self) -> u8 {
        (self.cx.rem_euclid(3) + 3 * self.cy.rem_euclid(3)) as u8
    }
}

/// Axis-aligned tile rectangle, inclusive on both corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRect {
    pub min: TilePos,
    pub max: TilePos,
}

impl TileRect {
    /// Build from two corners in any order.
    pub fn new(a: TilePos, b: TilePos) -> Self {
        Self {
            min: TilePos::new(a.x.min(b.x), a.y.min(b.y)),
            max: TilePos::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// Square of side `2 * radius + 1` around `center`.
    /// Corners saturate at the `i32` range.
    pub fn around(center: TilePos, radius: u32) -> Self {
        let r = i32::try_from(radius).unwrap_or(i32::MAX);
        Self::new(
            TilePos::new(center.x.saturating_sub(r), center.y.saturating_sub(r)),
            TilePos::new(center.x.saturating_add(r), center.y.saturating_add(r)),
        )
    }

    pub fn contains(&self, pos: TilePos) -> bool {
        pos.x >= self.min.x && pos.x <= self.max.x && pos.y >= self.min.y && pos.y <= self.max.y
    }

    /// Overlap with `other`, if any.
    pub fn intersect(&self, other: &TileRect) -> Option<TileRect> {
        let min = TilePos::new(self.min.x.max(other.min.x), self.min.y.max(other.min.y));
        let max = TilePos::new(self.max.x.min(other.max.x), self.max.y.min(other.max.y));
        (min.x <= max.x && min.y <= max.y).then_some(TileRect { min, max })
    }
}

/// A chunk-membership change recorded by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkChange {
    pub entity: EntityId,
    pub from: Option<ChunkCoord>,
    pub to: Option<ChunkCoord>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("tile ({}, {}) lies outside the {width}x{height} world", .pos.x, .pos.y)]
pub struct OutOfBoundsError {
    pub pos: TilePos,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpatialError {
    #[error(transparent)]
    OutOfBounds(#[from] OutOfBoundsError),
    #[error("tile ({}, {}) is occupied by {by}", .tile.x, .tile.y)]
    Occupied { tile: TilePos, by: EntityId },
    #[error("entity {0} is not placed")]
    NotPlaced(EntityId),
    #[error("entity {0} is already placed")]
    AlreadyPlaced(EntityId),
}

// ---------------------------------------------------------------------------
// SpatialIndex
// ---------------------------------------------------------------------------

/// Tile occupancy plus per-chunk entity membership.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    chunk_size: u32,
    width: u32,
    height: u32,
    positions: HashMap<EntityId, TilePos>,
    occupancy: HashMap<TilePos, EntityId>,
    chunks: HashMap<ChunkCoord, BTreeSet<EntityId>>,
    changes: Vec<ChunkChange>,
    seeded: BTreeSet<ChunkCoord>,
    pending_seed: BTreeSet<ChunkCoord>,
}

impl SpatialIndex {
    pub fn new(chunk_size: u32, width: u32, height: u32) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            width,
            height,
            positions: HashMap::new(),
            occupancy: HashMap::new(),
            chunks: HashMap::new(),
            changes: Vec::new(),
            seeded: BTreeSet::new(),
            pending_seed: BTreeSet::new(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// The whole world as a rectangle.
    pub fn extent(&self) -> TileRect {
        TileRect {
            min: TilePos::new(0, 0),
            max: TilePos::new(self.width as i32 - 1, self.height as i32 - 1),
        }
    }

    pub fn in_bounds(&self, pos: TilePos) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as u32) < self.width && (pos.y as u32) < self.height
    }

    pub fn check_bounds(&self, pos: TilePos) -> Result<(), OutOfBoundsError> {
        if self.in_bounds(pos) {
            Ok(())
        } else {
            Err(OutOfBoundsError {
                pos,
                width: self.width,
                height: self.height,
            })
        }
    }

    /// Number of chunks along each axis.
    pub fn chunk_dims(&self) -> (i32, i32) {
        let cs = self.chunk_size;
        (
            self.width.div_ceil(cs) as i32,
            self.height.div_ceil(cs) as i32,
        )
    }

    pub fn chunk_of(&self, pos: TilePos) -> ChunkCoord {
        let cs = self.chunk_size as i32;
        ChunkCoord::new(pos.x.div_euclid(cs), pos.y.div_euclid(cs))
    }

    /// Tiles covered by `chunk`, clipped to the world.
    pub fn chunk_bounds(&self, chunk: ChunkCoord) -> TileRect {
        let cs = self.chunk_size as i32;
        let rect = TileRect {
            min: TilePos::new(chunk.cx * cs, chunk.cy * cs),
            max: TilePos::new(chunk.cx * cs + cs - 1, chunk.cy * cs + cs - 1),
        };
        rect.intersect(&self.extent()).unwrap_or(rect)
    }

    fn chunk_in_world(&self, chunk: ChunkCoord) -> bool {
        let (w, h) = self.chunk_dims();
        chunk.cx >= 0 && chunk.cy >= 0 && chunk.cx < w && chunk.cy < h
    }

    fn note_touched(&mut self, chunk: ChunkCoord) {
        if !self.seeded.contains(&chunk) {
            self.pending_seed.insert(chunk);
        }
    }

    // -- Mutation --

    /// Place `entity` on `pos`.
    pub fn insert(&mut self, entity: EntityId, pos: TilePos) -> Result<(), SpatialError> {
        self.check_bounds(pos)?;
        if self.positions.contains_key(&entity) {
            return Err(SpatialError::AlreadyPlaced(entity));
        }
        if let Some(&by) = self.occupancy.get(&pos) {
            return Err(SpatialError::Occupied { tile: pos, by });
        }
        let chunk = self.chunk_of(pos);
        self.positions.insert(entity, pos);
        self.occupancy.insert(pos, entity);
        self.chunks.entry(chunk).or_default().insert(entity);
        self.changes.push(ChunkChange {
            entity,
            from: None,
            to: Some(chunk),
        });
        self.note_touched(chunk);
        Ok(())
    }

    /// Take `entity` off the grid. Returns where it stood.
    pub fn remove(&mut self, entity: EntityId) -> Result<TilePos, SpatialError> {
        let pos = self
            .positions
            .remove(&entity)
            .ok_or(SpatialError::NotPlaced(entity))?;
        self.occupancy.remove(&pos);
        let chunk = self.chunk_of(pos);
        if let Some(members) = self.chunks.get_mut(&chunk) {
            members.remove(&entity);
            if members.is_empty() {
                self.chunks.remove(&chunk);
            }
        }
        self.changes.push(ChunkChange {
            entity,
            from: Some(chunk),
            to: None,
        });
        Ok(pos)
    }

    /// Move `entity` to `to`, re-indexing its chunk when it crosses a
    /// chunk boundary.
    pub fn relocate(&mut self, entity: EntityId, to: TilePos) -> Result<(), SpatialError> {
        self.check_bounds(to)?;
        let from = *self
            .positions
            .get(&entity)
            .ok_or(SpatialError::NotPlaced(entity))?;
        if from == to {
            return Ok(());
        }
        if let Some(&by) = self.occupancy.get(&to) {
            return Err(SpatialError::Occupied { tile: to, by });
        }
        self.occupancy.remove(&from);
        self.occupancy.insert(to, entity);
        self.positions.insert(entity, to);

        let old_chunk = self.chunk_of(from);
        let new_chunk = self.chunk_of(to);
        if old_chunk != new_chunk {
            if let Some(members) = self.chunks.get_mut(&old_chunk) {
                members.remove(&entity);
                if members.is_empty() {
                    self.chunks.remove(&old_chunk);
                }
            }
            self.chunks.entry(new_chunk).or_default().insert(entity);
            self.changes.push(ChunkChange {
                entity,
                from: Some(old_chunk),
                to: Some(new_chunk),
            });
            self.note_touched(new_chunk);
        }
        Ok(())
    }

    // -- Queries --

    pub fn position_of(&self, entity: EntityId) -> Option<TilePos> {
        self.positions.get(&entity).copied()
    }

    pub fn occupant(&self, pos: TilePos) -> Option<EntityId> {
        self.occupancy.get(&pos).copied()
    }

    /// Entities standing inside `bounds`, visiting only the chunks it
    /// overlaps.
    pub fn query_region(&self, bounds: TileRect) -> BTreeSet<EntityId> {
        let mut found = BTreeSet::new();
        let Some(clipped) = bounds.intersect(&self.extent()) else {
            return found;
        };
        let lo = self.chunk_of(clipped.min);
        let hi = self.chunk_of(clipped.max);
        for cy in lo.cy..=hi.cy {
            for cx in lo.cx..=hi.cx {
                let Some(members) = self.chunks.get(&ChunkCoord::new(cx, cy)) else {
                    continue;
                };
                for &entity in members {
                    if self
                        .positions
                        .get(&entity)
                        .is_some_and(|p| clipped.contains(*p))
                    {
                        found.insert(entity);
                    }
                }
            }
        }
        found
    }

    /// Up to eight surrounding chunks inside the world, in row-major order.
    pub fn neighbors(&self, chunk: ChunkCoord) -> Vec<ChunkCoord> {
        let mut out = Vec::with_capacity(8);
        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let c = ChunkCoord::new(chunk.cx + dx, chunk.cy + dy);
                if self.chunk_in_world(c) {
                    out.push(c);
                }
            }
        }
        out
    }

    pub fn members(&self, chunk: ChunkCoord) -> Option<&BTreeSet<EntityId>> {
        self.chunks.get(&chunk)
    }

    /// Chunks that currently hold at least one entity, sorted.
    pub fn occupied_chunks(&self) -> Vec<ChunkCoord> {
        let mut chunks: Vec<_> = self.chunks.keys().copied().collect();
        chunks.sort_unstable();
        chunks
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    // -- Notifications --

    /// Membership changes since the last drain, in the order they happened.
    pub fn drain_changes(&mut self) -> Vec<ChunkChange> {
        std::mem::take(&mut self.changes)
    }

    // -- Lazy seeding --

    /// Mark every unseeded chunk overlapping `bounds` for generation.
    pub fn touch_region(&mut self, bounds: TileRect) {
        let Some(clipped) = bounds.intersect(&self.extent()) else {
            return;
        };
        let lo = self.chunk_of(clipped.min);
        let hi = self.chunk_of(clipped.max);
        for cy in lo.cy..=hi.cy {
            for cx in lo.cx..=hi.cx {
                self.note_touched(ChunkCoord::new(cx, cy));
            }
        }
    }

    /// Take the chunks awaiting generation and mark them seeded.
    pub fn take_pending_seeds(&mut self) -> Vec<ChunkCoord> {
        let pending = std::mem::take(&mut self.pending_seed);
        self.seeded.extend(pending.iter().copied());
        pending.into_iter().collect()
    }

    /// Chunks touched but not yet generated, sorted.
    pub fn pending_seeds(&self) -> impl Iterator<Item = ChunkCoord> + '_ {
        self.pending_seed.iter().copied()
    }

    pub fn is_seeded(&self, chunk: ChunkCoord) -> bool {
        self.seeded.contains(&chunk)
    }

    pub fn seeded_chunks(&self) -> &BTreeSet<ChunkCoord> {
        &self.seeded
    }

    /// Restore the seeded set (used on load).
    pub fn set_seeded(&mut self, seeded: BTreeSet<ChunkCoord>) {
        self.pending_seed.retain(|c| !seeded.contains(c));
        self.seeded = seeded;
    }
}

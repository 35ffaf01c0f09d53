//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::component::{Capability, ComponentSet, Consumer, EntityFault, Inventory, Producer};
use crate::config::SimConfig;
use crate::fixed::Fixed64;
use crate::handler::{EntityScratch, HandlerContext, UpdateHandler};
use crate::id::{ConnectionId, EntityId, ResourceTypeId};
use crate::placement::{LinkDirection, LinkSpec, Placement};
use crate::spatial::TilePos;
use crate::store::EntityStore;
use crate::world::World;

// ===========================================================================
// Numbers and resources
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

pub fn ore() -> ResourceTypeId {
    ResourceTypeId(0)
}

pub fn plate() -> ResourceTypeId {
    ResourceTypeId(1)
}

pub fn water() -> ResourceTypeId {
    ResourceTypeId(2)
}

// ===========================================================================
// Config
// ===========================================================================

/// 32x32 tiles in 8x8 chunks, two workers.
pub fn small_config() -> SimConfig {
    SimConfig {
        chunk_size: 8,
        world_width: 32,
        world_height: 32,
        worker_count: Some(2),
        ..SimConfig::default()
    }
}

pub fn config_with_workers(workers: usize) -> SimConfig {
    SimConfig {
        worker_count: Some(workers),
        ..small_config()
    }
}

// ===========================================================================
// Entity constructors
// ===========================================================================

/// A machine producing `rate` per tick into a buffer of `capacity`.
pub fn source(pos: TilePos, resource: ResourceTypeId, rate: f64, capacity: f64) -> ComponentSet {
    ComponentSet::machine(pos)
        .with_inventory(Inventory::new().with_buffer(resource, fixed(capacity)))
        .with_producer(Producer {
            resource,
            rate: fixed(rate),
            requires: None,
        })
}

/// A machine draining `rate` per tick from a buffer of `capacity`.
pub fn sink(pos: TilePos, resource: ResourceTypeId, rate: f64, capacity: f64) -> ComponentSet {
    ComponentSet::machine(pos)
        .with_inventory(Inventory::new().with_buffer(resource, fixed(capacity)))
        .with_consumer(Consumer {
            resource,
            rate: fixed(rate),
        })
}

/// A wall tile.
pub fn wall(x: i32, y: i32) -> ComponentSet {
    ComponentSet::structure(TilePos::new(x, y))
}

/// A unit taking one tick per step.
pub fn unit_at(x: i32, y: i32) -> ComponentSet {
    ComponentSet::unit(TilePos::new(x, y), 1)
}

/// Link the placed entity's input to `from`'s output.
pub fn fed_by(from: EntityId, resource: ResourceTypeId, capacity: f64) -> LinkSpec {
    LinkSpec::simple(LinkDirection::In, from, resource, fixed(capacity))
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[derive(Debug, Clone, Copy)]
pub struct Conveyor {
    pub source: EntityId,
    pub sink: EntityId,
    pub link: ConnectionId,
}

/// Source 15/tick (buffer 100) at (1, 1) feeding a sink 5/tick (buffer 50)
/// at (4, 1) over a capacity-10 conveyor.
pub fn conveyor_line(world: &mut World) -> Conveyor {
    conveyor_at(world, TilePos::new(1, 1), TilePos::new(4, 1))
}

pub fn conveyor_at(world: &mut World, from: TilePos, to: TilePos) -> Conveyor {
    let source = world
        .place(source(from, ore(), 15.0, 100.0))
        .expect("source placement");
    let sink = world
        .place(Placement::new(sink(to, ore(), 5.0, 50.0)).with_link(fed_by(source, ore(), 10.0)))
        .expect("sink placement");
    let link = world
        .flow()
        .connections_of(sink)
        .next()
        .map(|c| c.id)
        .expect("sink has a link");
    Conveyor { source, sink, link }
}

/// `rows` x `cols` conveyor pairs spread over the world, one pair every
/// four tiles, plus a wandering unit per row.
pub fn build_grid_factory(world: &mut World, rows: i32, cols: i32) -> Vec<Conveyor> {
    let mut lines = Vec::new();
    for r in 0..rows {
        for c in 0..cols {
            let x = c * 4;
            let y = r * 4;
            lines.push(conveyor_at(world, TilePos::new(x, y), TilePos::new(x + 2, y)));
        }
        let unit = world
            .place(unit_at(1, r * 4 + 2))
            .expect("unit placement");
        world
            .assign_task(unit, crate::planner::Goal::MoveTo(TilePos::new(cols * 4 - 1, r * 4 + 2)))
            .expect("unit task");
    }
    lines
}

pub fn amount(store: &EntityStore, entity: EntityId, resource: ResourceTypeId) -> Fixed64 {
    store
        .get::<Inventory>(entity)
        .map(|inv| inv.amount(resource))
        .unwrap_or(Fixed64::ZERO)
}

// ===========================================================================
// Misbehaving handlers
// ===========================================================================

/// Panics on its first call, then behaves.
#[derive(Debug)]
pub struct PanicOnce {
    armed: AtomicBool,
}

impl PanicOnce {
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(true),
        }
    }
}

impl Default for PanicOnce {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateHandler for PanicOnce {
    fn name(&self) -> &str {
        "panic_once"
    }

    fn capability(&self) -> Capability {
        Capability::Producer
    }

    fn update(
        &self,
        _ctx: &mut HandlerContext<'_>,
        _scratch: &mut EntityScratch,
    ) -> Result<(), EntityFault> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("injected worker panic");
        }
        Ok(())
    }
}

/// Panics on every call.
#[derive(Debug, Default)]
pub struct AlwaysPanic {
    pub calls: AtomicU32,
}

impl UpdateHandler for AlwaysPanic {
    fn name(&self) -> &str {
        "always_panic"
    }

    fn capability(&self) -> Capability {
        Capability::Producer
    }

    fn update(
        &self,
        _ctx: &mut HandlerContext<'_>,
        _scratch: &mut EntityScratch,
    ) -> Result<(), EntityFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("injected persistent panic");
    }
}

/// Fails for one entity, once.
#[derive(Debug)]
pub struct FaultOnce {
    pub target: EntityId,
    armed: AtomicBool,
}

impl FaultOnce {
    pub fn new(target: EntityId) -> Self {
        Self {
            target,
            armed: AtomicBool::new(true),
        }
    }
}

impl UpdateHandler for FaultOnce {
    fn name(&self) -> &str {
        "fault_once"
    }

    fn capability(&self) -> Capability {
        Capability::Producer
    }

    fn update(
        &self,
        _ctx: &mut HandlerContext<'_>,
        scratch: &mut EntityScratch,
    ) -> Result<(), EntityFault> {
        if scratch.id == self.target && self.armed.swap(false, Ordering::SeqCst) {
            return Err(EntityFault::Handler("injected fault".into()));
        }
        Ok(())
    }
}

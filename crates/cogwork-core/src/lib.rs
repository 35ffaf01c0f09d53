//! Cogwork Core -- the tick-based simulation core of a factory-automation game.
//!
//! The crate owns the world's live state and advances it in discrete,
//! deterministic ticks: machines produce and consume, resources flow over
//! capacity-limited connections, and units walk planned routes across a
//! chunked tile grid. Every committed tick is published as an immutable
//! [`snapshot::TickSnapshot`] that any thread can read.
//!
//! # Tick Pipeline
//!
//! Each call to [`world::World::tick`] runs:
//!
//! 1. **Pre-tick** -- Apply queued commands and seed newly touched chunks.
//! 2. **Flow batch** -- Resolve every flow subgraph in parallel.
//! 3. **Spatial batches** -- Nine colour classes of chunks; handlers update
//!    machines and units in parallel, results commit in entity-id order.
//! 4. **Planner slot** -- Advance unit tasks against the previous snapshot.
//! 5. **Modules** -- Registered observers run.
//! 6. **Commit** -- Capture, hash and publish the snapshot; advance the clock.
//!
//! Results are identical for any worker count.
//!
//! # Key Types
//!
//! - [`world::World`] -- Live state, tick pipeline and clock.
//! - [`store::EntityStore`] -- Component tables keyed by [`id::EntityId`].
//! - [`spatial::SpatialIndex`] -- Tile occupancy and chunk membership.
//! - [`flow::FlowNetwork`] -- Connections and proportional flow resolution.
//! - [`scheduler::Scheduler`] -- Batch planning and parallel execution.
//! - [`planner::Planner`] -- Unit tasks and A* routing.
//! - [`fixed::Fixed64`] -- Q32.32 fixed-point type for deterministic math.
//! - [`serialize`] -- Versioned snapshot files via bitcode.

pub mod clock;
pub mod command_queue;
pub mod component;
pub mod config;
pub mod event;
pub mod fixed;
pub mod flow;
pub mod handler;
pub mod id;
pub mod migration;
pub mod module;
pub mod placement;
pub mod planner;
pub mod replay;
pub mod scheduler;
pub mod serialize;
pub mod snapshot;
pub mod spatial;
pub mod store;
pub mod world;
pub mod worldgen;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

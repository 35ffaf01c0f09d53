//! Units acting on signals.
//!
//! A world runs with the signals module registered; tests read the field,
//! turn signals into planner goals and check that units arrive where the
//! signal came from.

use std::sync::Arc;

use cogwork_core::command_queue::Command;
use cogwork_core::id::EntityId;
use cogwork_core::planner::{Goal, TaskState};
use cogwork_core::spatial::TilePos;
use cogwork_core::test_utils::*;
use cogwork_core::world::World;
use cogwork_signals::{Signal, SignalConfig, SignalsModule};

const SEARCH_LIMIT: u32 = 4096;

fn world_with_signals() -> World {
    let mut world = World::new(small_config()).unwrap();
    world
        .register_module(Box::new(SignalsModule::new(SignalConfig::default())))
        .unwrap();
    world
}

/// Step until `task` reaches a terminal state; returns it.
fn run_task(world: &mut World, task: cogwork_core::id::TaskId, limit: usize) -> Option<TaskState> {
    for _ in 0..limit {
        let report = world.step().unwrap();
        if let Some(t) = report
            .transitions
            .iter()
            .find(|t| t.task == task && t.to.is_terminal())
        {
            return Some(t.to);
        }
    }
    None
}

fn adjacent(world: &World, unit: EntityId, target: TilePos) -> bool {
    world
        .spatial()
        .position_of(unit)
        .is_some_and(|p| p.manhattan_distance(&target) == 1)
}

// ===========================================================================
// Haulers follow Push
// ===========================================================================

#[test]
fn hauler_walks_to_a_backed_up_source() {
    let mut world = world_with_signals();
    let source_tile = TilePos::new(3, 3);
    let source = world.place(source(source_tile, ore(), 15.0, 20.0)).unwrap();
    let hauler = world.place(unit_at(9, 3)).unwrap();
    for _ in 0..8 {
        world.step().unwrap();
    }

    let snapshot = world.latest();
    let module = world.module::<SignalsModule>().unwrap();
    let push = Signal::Push(ore());
    assert!(module.strength(push, source_tile) > module.strength(push, TilePos::new(4, 3)));
    assert_eq!(
        module.upstream(&snapshot, TilePos::new(5, 3), push),
        Some(TilePos::new(4, 3))
    );

    let goal = module
        .suggest_goal(&snapshot, TilePos::new(9, 3), push, 10, SEARCH_LIMIT)
        .unwrap();
    assert_eq!(goal, Goal::Visit(source));

    let task = world.assign_task(hauler, goal).unwrap();
    assert_eq!(run_task(&mut world, task, 40), Some(TaskState::Completed));
    assert!(adjacent(&world, hauler, source_tile));
}

#[test]
fn no_goal_without_a_matching_signal() {
    let mut world = world_with_signals();
    world.place(source(TilePos::new(3, 3), ore(), 15.0, 20.0)).unwrap();
    for _ in 0..8 {
        world.step().unwrap();
    }
    let snapshot = world.latest();
    let module = world.module::<SignalsModule>().unwrap();
    assert!(module
        .suggest_goal(&snapshot, TilePos::new(9, 3), Signal::Push(water()), 10, SEARCH_LIMIT)
        .is_none());
    // Out of range.
    assert!(module
        .suggest_goal(&snapshot, TilePos::new(25, 25), Signal::Push(ore()), 5, SEARCH_LIMIT)
        .is_none());
}

#[test]
fn walled_in_source_yields_no_reachable_goal() {
    let mut world = world_with_signals();
    let source_tile = TilePos::new(10, 10);
    world.place(source(source_tile, ore(), 15.0, 20.0)).unwrap();
    for tile in source_tile.neighbors_4() {
        world.place(wall(tile.x, tile.y)).unwrap();
    }
    for _ in 0..8 {
        world.step().unwrap();
    }
    let snapshot = world.latest();
    let module = world.module::<SignalsModule>().unwrap();
    // The signal stays trapped on the source tile.
    assert!(module.strength(Signal::Push(ore()), source_tile) > cogwork_core::fixed::Fixed64::ZERO);
    assert!(module
        .suggest_goal(&snapshot, TilePos::new(14, 10), Signal::Push(ore()), 8, SEARCH_LIMIT)
        .is_none());
}

// ===========================================================================
// Repairers follow Work
// ===========================================================================

#[test]
fn repairer_answers_a_faulted_machine() {
    let mut world = world_with_signals();
    let machine_tile = TilePos::new(6, 6);
    let machine = world.place(source(machine_tile, ore(), 2.0, 100.0)).unwrap();
    world.register_handler(Arc::new(FaultOnce::new(machine)));
    let repairer = world.place(unit_at(12, 6)).unwrap();

    for _ in 0..4 {
        world.step().unwrap();
    }
    assert!(world.store().is_errored(machine));

    let snapshot = world.latest();
    let module = world.module::<SignalsModule>().unwrap();
    let work = Signal::Work(machine);
    assert!(module.strength(work, machine_tile) > cogwork_core::fixed::Fixed64::ZERO);
    let goal = module
        .suggest_goal(&snapshot, TilePos::new(12, 6), work, 10, SEARCH_LIMIT)
        .unwrap();
    assert_eq!(goal, Goal::Visit(machine));

    let task = world.assign_task(repairer, goal).unwrap();
    assert_eq!(run_task(&mut world, task, 40), Some(TaskState::Completed));
    assert!(adjacent(&world, repairer, machine_tile));

    world.submit(Command::Repair(machine));
    world.step().unwrap();
    assert!(!world.store().is_errored(machine));

    // Work stops being emitted and fades away.
    for _ in 0..150 {
        world.step().unwrap();
    }
    let module = world.module::<SignalsModule>().unwrap();
    assert_eq!(
        module.strength(work, machine_tile),
        cogwork_core::fixed::Fixed64::ZERO
    );
}

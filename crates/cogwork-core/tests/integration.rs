//! Integration tests for the Cogwork core.
//!
//! These run whole worlds through the public API: production chains, lazy
//! chunk seeding, persistence, task failure paths and concurrent readers.

use cogwork_core::command_queue::Command;
use cogwork_core::component::{ComponentSet, Ingredient, Inventory, MachineState, Producer};
use cogwork_core::config::SimConfig;
use cogwork_core::event::Event;
use cogwork_core::fixed::Fixed64;
use cogwork_core::placement::Placement;
use cogwork_core::planner::{FailureReason, Goal, TaskState};
use cogwork_core::spatial::{ChunkCoord, TilePos, TileRect};
use cogwork_core::test_utils::*;
use cogwork_core::world::World;
use cogwork_core::worldgen::ChunkSeed;

// ===========================================================================
// Production chain
// ===========================================================================
//
// Ore source --> smelter (2 ore per plate) --> plate sink.

#[test]
fn smelting_chain_delivers_plates() {
    let mut world = World::new(small_config()).unwrap();
    let mine = world
        .place(source(TilePos::new(1, 3), ore(), 10.0, 50.0))
        .unwrap();
    let smelter = world
        .place(
            Placement::new(
                ComponentSet::machine(TilePos::new(3, 3))
                    .with_inventory(
                        Inventory::new()
                            .with_buffer(ore(), fixed(50.0))
                            .with_buffer(plate(), fixed(50.0)),
                    )
                    .with_producer(Producer {
                        resource: plate(),
                        rate: fixed(2.0),
                        requires: Some(Ingredient {
                            resource: ore(),
                            ratio: fixed(2.0),
                        }),
                    }),
            )
            .with_link(fed_by(mine, ore(), 10.0)),
        )
        .unwrap();
    let sink = world
        .place(
            Placement::new(sink(TilePos::new(5, 3), plate(), 1.0, 20.0))
                .with_link(fed_by(smelter, plate(), 5.0)),
        )
        .unwrap();

    for _ in 0..20 {
        world.step().unwrap();
    }

    let state = world.store().get::<MachineState>(smelter).unwrap();
    assert!(state.produced_total > Fixed64::ZERO, "smelter never produced");
    assert!(state.consumed_total >= Fixed64::ZERO);
    let delivered = world.store().get::<MachineState>(sink).unwrap().consumed_total;
    assert!(delivered > Fixed64::ZERO, "no plates reached the sink");
    // Two ore per plate: the smelter cannot have emitted more than half of
    // what the mine sent.
    let mined = world.store().get::<MachineState>(mine).unwrap().produced_total;
    assert!(state.produced_total * fixed(2.0) <= mined);
}

// ===========================================================================
// Lazy chunk seeding
// ===========================================================================

fn deposit_world() -> World {
    let mut world = World::new(small_config()).unwrap();
    world.set_generator(Box::new(|_coord: ChunkCoord, bounds: TileRect| {
        let at = TilePos::new(bounds.min.x + 4, bounds.min.y + 4);
        ChunkSeed::new().with(Placement::new(source(at, ore(), 1.0, 10.0)))
    }));
    world
}

fn seeded_chunks(events: &[Event]) -> Vec<(ChunkCoord, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ChunkSeeded { chunk, placed, .. } => Some((*chunk, *placed)),
            _ => None,
        })
        .collect()
}

#[test]
fn touched_chunks_are_seeded_once() {
    let mut world = deposit_world();
    world.place(unit_at(1, 1)).unwrap();

    let first = world.step().unwrap();
    assert_eq!(seeded_chunks(&first.events), vec![(ChunkCoord::new(0, 0), 1)]);
    assert!(world.spatial().occupant(TilePos::new(4, 4)).is_some());

    world.touch_region(TileRect::new(TilePos::new(0, 0), TilePos::new(17, 17)));
    let second = world.step().unwrap();
    let chunks: Vec<ChunkCoord> = seeded_chunks(&second.events)
        .into_iter()
        .map(|(c, _)| c)
        .collect();
    assert_eq!(chunks.len(), 8, "the origin chunk must not be seeded again");
    assert!(!chunks.contains(&ChunkCoord::new(0, 0)));
    assert!(world.spatial().occupant(TilePos::new(20, 20)).is_some());

    let third = world.step().unwrap();
    assert!(seeded_chunks(&third.events).is_empty());
}

#[test]
fn seeding_is_the_same_in_every_world() {
    let run = || {
        let mut world = deposit_world();
        world.place(unit_at(1, 1)).unwrap();
        world.touch_region(TileRect::new(TilePos::new(8, 8), TilePos::new(31, 31)));
        (0..4).map(|_| world.step().unwrap().state_hash).collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

// ===========================================================================
// Persistence
// ===========================================================================

#[test]
fn saved_world_resumes_identically_after_load() {
    let path = std::env::temp_dir().join(format!("cogwork-resume-{}.snap", std::process::id()));

    let mut world = World::new(small_config()).unwrap();
    conveyor_line(&mut world);
    let unit = world.place(unit_at(1, 8)).unwrap();
    world
        .assign_task(unit, Goal::MoveTo(TilePos::new(20, 8)))
        .unwrap();
    for _ in 0..4 {
        world.step().unwrap();
    }
    world.save(&path).unwrap();

    let mut loaded = World::load(small_config(), &path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded.current_tick(), 4);
    assert_eq!(loaded.state_hash(), world.state_hash());

    for _ in 0..8 {
        let a = world.step().unwrap();
        let b = loaded.step().unwrap();
        assert_eq!(a.tick, b.tick);
        assert_eq!(a.state_hash, b.state_hash, "diverged at tick {}", a.tick);
    }
}

#[test]
fn loading_a_missing_file_fails_cleanly() {
    let path = std::env::temp_dir().join("cogwork-does-not-exist.snap");
    assert!(World::load(small_config(), &path).is_err());
}

// ===========================================================================
// Tasks
// ===========================================================================

#[test]
fn unit_routes_around_a_wall() {
    let mut world = World::new(small_config()).unwrap();
    for y in 0..10 {
        world.place(wall(6, y)).unwrap();
    }
    let unit = world.place(unit_at(3, 2)).unwrap();
    let task = world
        .assign_task(unit, Goal::MoveTo(TilePos::new(9, 2)))
        .unwrap();

    let mut completed = false;
    for _ in 0..60 {
        let report = world.step().unwrap();
        if report
            .transitions
            .iter()
            .any(|t| t.task == task && t.to == TaskState::Completed)
        {
            completed = true;
            break;
        }
    }
    assert!(completed, "unit never reached the far side of the wall");
    assert_eq!(world.spatial().position_of(unit), Some(TilePos::new(9, 2)));
}

#[test]
fn destroyed_visit_target_fails_the_task() {
    let mut world = World::new(small_config()).unwrap();
    let target = world.place(wall(20, 20)).unwrap();
    let unit = world.place(unit_at(1, 1)).unwrap();
    let task = world.assign_task(unit, Goal::Visit(target)).unwrap();
    world.step().unwrap();
    world.step().unwrap();

    world.submit(Command::Destroy(target));
    let mut outcome = None;
    for _ in 0..4 {
        let report = world.step().unwrap();
        if let Some(t) = report.transitions.iter().find(|t| t.task == task) {
            outcome = Some(t.to);
        }
    }
    assert_eq!(outcome, Some(TaskState::Failed(FailureReason::TargetGone)));
}

#[test]
fn destroying_a_unit_fails_its_tasks() {
    let mut world = World::new(small_config()).unwrap();
    let unit = world.place(unit_at(1, 1)).unwrap();
    let task = world
        .assign_task(unit, Goal::MoveTo(TilePos::new(30, 30)))
        .unwrap();
    world.step().unwrap();

    world.submit(Command::Destroy(unit));
    let report = world.step().unwrap();
    let failed = report.transitions.iter().find(|t| t.task == task).unwrap();
    assert_eq!(failed.to, TaskState::Failed(FailureReason::UnitGone));
    assert!(report
        .events
        .iter()
        .any(|e| matches!(e, Event::EntityDestroyed { entity, .. } if *entity == unit)));
}

// ===========================================================================
// History and readers
// ===========================================================================

#[test]
fn history_keeps_configured_depth() {
    let config = SimConfig {
        snapshot_history: 3,
        ..small_config()
    };
    let mut world = World::new(config).unwrap();
    for _ in 0..10 {
        world.tick().unwrap();
    }
    let ticks: Vec<u64> = world.history().iter().map(|s| s.tick).collect();
    assert_eq!(ticks, vec![8, 9, 10]);
    assert!(world.history().at_tick(7).is_none());
    assert_eq!(world.history().at_tick(9).unwrap().tick, 9);
}

#[test]
fn readers_on_other_threads_see_monotonic_ticks() {
    let mut world = World::new(small_config()).unwrap();
    conveyor_line(&mut world);
    let handle = world.handle();

    std::thread::scope(|scope| {
        let reader = scope.spawn(move || {
            let mut last = 0;
            let mut seen = 0;
            while last < 25 {
                let snapshot = handle.latest();
                assert!(snapshot.tick >= last, "tick went backwards");
                last = snapshot.tick;
                seen += 1;
                std::thread::yield_now();
            }
            seen
        });
        for _ in 0..25 {
            world.tick().unwrap();
        }
        assert!(reader.join().unwrap() > 0);
    });
    assert_eq!(world.latest().tick, 25);
}

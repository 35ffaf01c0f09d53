//! Unit task planner.
//!
//! The planner owns every task in a slot map; units only hold a weak
//! [`TaskId`] back-reference, which stops resolving once the task is
//! reaped. Each unit has a job queue and works on its head task.
//!
//! Task state machine:
//!
//! ```text
//! Queued  -> Active (path found) | Blocked (no path)
//! Active  -> Completed | Failed | Blocked | Active (replanned)
//! Blocked -> Active (re-check found a path) | Failed (retry limit)
//! ```
//!
//! A unit that waits on an occupied tile for `stall_limit` ticks is
//! rerouted around other units. Blocked re-checks also route around units,
//! so a goal held by a parked unit ends as `Failed(Unreachable)`.
//!
//! Terminal states never change. Planning reads the previous committed
//! snapshot through [`PlanView`] and returns [`PathProposal`]s that the
//! world commits in the planner slot.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::fixed::Ticks;
use crate::id::{EntityId, TaskId};
use crate::spatial::TilePos;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Goal {
    MoveTo(TilePos),
    /// Reach a tile orthogonally adjacent to the entity.
    Visit(EntityId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Cancelled,
    Unreachable,
    TargetGone,
    UnitGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Active,
    Blocked,
    Completed,
    Failed(FailureReason),
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub unit: EntityId,
    pub goal: Goal,
    pub state: TaskState,
    /// Failed re-checks since the task last had a path.
    pub retries: u32,
    /// Planned route, next tile first.
    pub path: Vec<TilePos>,
    pub created_tick: Ticks,
    /// Tick at which the task became terminal.
    pub finished_tick: Option<Ticks>,
}

/// A state change observed during planning or cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTransition {
    pub task: TaskId,
    pub unit: EntityId,
    pub from: TaskState,
    pub to: TaskState,
}

/// A write to a unit's `Mover`, committed in the planner slot.
#[derive(Debug, Clone, PartialEq)]
pub struct PathProposal {
    pub unit: EntityId,
    /// New route; empty clears the route.
    pub path: Vec<TilePos>,
    pub task: Option<TaskId>,
}

#[derive(Debug, Default)]
pub struct PlannerOutput {
    pub proposals: Vec<PathProposal>,
    pub transitions: Vec<TaskTransition>,
    pub reaped: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlannerError {
    #[error("task {0:?} not found")]
    UnknownTask(TaskId),
    #[error("{0} is not a unit")]
    NotAUnit(EntityId),
}

/// What the planner needs to know about the world.
pub trait PlanView {
    fn unit_position(&self, unit: EntityId) -> Option<TilePos>;
    fn entity_position(&self, entity: EntityId) -> Option<TilePos>;
    /// In bounds and not blocked by a machine or structure.
    fn is_passable(&self, tile: TilePos) -> bool;
    /// Consecutive ticks the unit's next step was occupied.
    fn stalled_ticks(&self, _unit: EntityId) -> u32 {
        0
    }
    /// The unit standing on `tile`, if any.
    fn unit_at(&self, _tile: TilePos) -> Option<EntityId> {
        None
    }
}

/// `view` with tiles held by units other than `unit` treated as blocked.
struct AvoidUnits<'a> {
    view: &'a dyn PlanView,
    unit: EntityId,
}

impl PlanView for AvoidUnits<'_> {
    fn unit_position(&self, unit: EntityId) -> Option<TilePos> {
        self.view.unit_position(unit)
    }

    fn entity_position(&self, entity: EntityId) -> Option<TilePos> {
        self.view.entity_position(entity)
    }

    fn is_passable(&self, tile: TilePos) -> bool {
        self.view.is_passable(tile) && self.view.unit_at(tile).is_none_or(|u| u == self.unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerLimits {
    pub retry_limit: u32,
    pub search_limit: u32,
    /// Stalled ticks before an active task is rerouted around units.
    pub stall_limit: u32,
}

impl Default for PlannerLimits {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            search_limit: 4096,
            stall_limit: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Planner {
    tasks: SlotMap<TaskId, Task>,
    queues: BTreeMap<EntityId, VecDeque<TaskId>>,
    #[serde(skip)]
    limits: PlannerLimits,
}

impl PartialEq for Planner {
    fn eq(&self, other: &Self) -> bool {
        self.tasks.iter().eq(other.tasks.iter()) && self.queues == other.queues
    }
}

impl Planner {
    pub fn new(limits: PlannerLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn set_limits(&mut self, limits: PlannerLimits) {
        self.limits = limits;
    }

    pub fn limits(&self) -> PlannerLimits {
        self.limits
    }

    /// Queue `goal` for `unit`.
    pub fn assign(&mut self, unit: EntityId, goal: Goal, tick: Ticks) -> TaskId {
        let id = self.tasks.insert(Task {
            unit,
            goal,
            state: TaskState::Queued,
            retries: 0,
            path: Vec::new(),
            created_tick: tick,
            finished_tick: None,
        });
        self.queues.entry(unit).or_default().push_back(id);
        tracing::debug!(?id, %unit, ?goal, "task assigned");
        id
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(id).map(|t| t.state)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &Task)> {
        self.tasks.iter()
    }

    pub fn queue(&self, unit: EntityId) -> impl Iterator<Item = TaskId> + '_ {
        self.queues.get(&unit).into_iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn finish(&mut self, id: TaskId, to: TaskState, tick: Ticks) -> Option<TaskTransition> {
        let task = self.tasks.get_mut(id)?;
        if task.state.is_terminal() {
            return None;
        }
        let from = task.state;
        task.state = to;
        task.finished_tick = Some(tick);
        task.path.clear();
        Some(TaskTransition {
            task: id,
            unit: task.unit,
            from,
            to,
        })
    }

    /// Make a task terminal as `Failed(Cancelled)`. Terminal tasks are left
    /// as they are.
    pub fn cancel(
        &mut self,
        id: TaskId,
        tick: Ticks,
    ) -> Result<Option<TaskTransition>, PlannerError> {
        if !self.tasks.contains_key(id) {
            return Err(PlannerError::UnknownTask(id));
        }
        Ok(self.finish(id, TaskState::Failed(FailureReason::Cancelled), tick))
    }

    /// Fail every live task of `unit` with `reason`.
    pub fn fail_unit(
        &mut self,
        unit: EntityId,
        reason: FailureReason,
        tick: Ticks,
    ) -> Vec<TaskTransition> {
        let ids: Vec<TaskId> = self.queue(unit).collect();
        ids.into_iter()
            .filter_map(|id| self.finish(id, TaskState::Failed(reason), tick))
            .collect()
    }

    pub fn cancel_unit(&mut self, unit: EntityId, tick: Ticks) -> Vec<TaskTransition> {
        self.fail_unit(unit, FailureReason::Cancelled, tick)
    }

    /// Advance one task against `view`. Returns the resulting state.
    pub fn advance(
        &mut self,
        id: TaskId,
        view: &dyn PlanView,
        tick: Ticks,
    ) -> Result<TaskState, PlannerError> {
        let mut out = PlannerOutput::default();
        self.step_task(id, view, tick, &mut out)?;
        self.state(id).ok_or(PlannerError::UnknownTask(id))
    }

    /// The planner slot: reap tasks that finished before `tick`, then
    /// advance every unit's head task.
    pub fn run_slot(&mut self, view: &dyn PlanView, tick: Ticks) -> PlannerOutput {
        let mut out = PlannerOutput::default();
        self.reap(tick, &mut out);

        let heads: Vec<TaskId> = self
            .queues
            .values()
            .filter_map(|q| {
                q.iter()
                    .copied()
                    .find(|id| self.tasks.get(*id).is_some_and(|t| !t.state.is_terminal()))
            })
            .collect();
        for id in heads {
            // Heads come from the queues, so the task exists.
            let _ = self.step_task(id, view, tick, &mut out);
        }
        out
    }

    fn reap(&mut self, tick: Ticks, out: &mut PlannerOutput) {
        let done: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.finished_tick.is_some_and(|f| f < tick))
            .map(|(id, _)| id)
            .collect();
        if done.is_empty() {
            return;
        }
        for id in &done {
            if let Some(task) = self.tasks.remove(*id) {
                if let Some(q) = self.queues.get_mut(&task.unit) {
                    q.retain(|t| t != id);
                    if q.is_empty() {
                        self.queues.remove(&task.unit);
                    }
                }
            }
        }
        self.canonicalize();
        tracing::debug!(count = done.len(), "reaped finished tasks");
        out.reaped = done;
    }

    /// Rebuild the task slot map through its serialized form, so the free
    /// list matches what a reload produces and key allocation after a
    /// save/load continues identically.
    fn canonicalize(&mut self) {
        match bitcode::serialize(&self.tasks)
            .map_err(|e| e.to_string())
            .and_then(|bytes| bitcode::deserialize(&bytes).map_err(|e| e.to_string()))
        {
            Ok(tasks) => self.tasks = tasks,
            Err(e) => tracing::warn!(error = %e, "task map canonicalization failed"),
        }
    }

    fn step_task(
        &mut self,
        id: TaskId,
        view: &dyn PlanView,
        tick: Ticks,
        out: &mut PlannerOutput,
    ) -> Result<(), PlannerError> {
        let task = self.tasks.get(id).ok_or(PlannerError::UnknownTask(id))?;
        if task.state.is_terminal() {
            return Ok(());
        }
        let unit = task.unit;
        let goal = task.goal;
        let from = task.state;

        let Some(start) = view.unit_position(unit) else {
            // Units placed this tick are not in the snapshot yet.
            return Ok(());
        };

        let target = match goal {
            Goal::MoveTo(tile) => Some(tile),
            Goal::Visit(entity) => view.entity_position(entity),
        };
        let Some(target) = target else {
            if let Some(t) = self.finish(id, TaskState::Failed(FailureReason::TargetGone), tick) {
                out.transitions.push(t);
                out.proposals.push(PathProposal {
                    unit,
                    path: Vec::new(),
                    task: None,
                });
            }
            return Ok(());
        };

        if goal_reached(goal, start, target) {
            if let Some(t) = self.finish(id, TaskState::Completed, tick) {
                out.transitions.push(t);
                out.proposals.push(PathProposal {
                    unit,
                    path: Vec::new(),
                    task: None,
                });
            }
            return Ok(());
        }

        let limits = self.limits;
        let (needs_search, avoid_units) = match from {
            TaskState::Queued => (true, false),
            TaskState::Blocked => (true, true),
            TaskState::Active => {
                let task = self.tasks.get_mut(id).ok_or(PlannerError::UnknownTask(id))?;
                trim_walked(&mut task.path, start);
                let stalled = view.stalled_ticks(unit) >= limits.stall_limit;
                if stalled {
                    tracing::debug!(?id, %unit, "rerouting stalled unit");
                }
                (stalled || !path_still_valid(&task.path, start, view), stalled)
            }
            TaskState::Completed | TaskState::Failed(_) => (false, false),
        };
        if !needs_search {
            return Ok(());
        }

        let found = if avoid_units {
            let avoiding = AvoidUnits { view, unit };
            find_path(start, goal, target, &avoiding, limits.search_limit)
        } else {
            find_path(start, goal, target, view, limits.search_limit)
        };
        let task = self.tasks.get_mut(id).ok_or(PlannerError::UnknownTask(id))?;
        match found {
            Some(path) => {
                task.state = TaskState::Active;
                task.retries = 0;
                task.path = path.clone();
                out.proposals.push(PathProposal {
                    unit,
                    path,
                    task: Some(id),
                });
            }
            None => {
                if from == TaskState::Blocked {
                    task.retries += 1;
                    if task.retries >= limits.retry_limit {
                        if let Some(t) =
                            self.finish(id, TaskState::Failed(FailureReason::Unreachable), tick)
                        {
                            out.transitions.push(t);
                        }
                        out.proposals.push(PathProposal {
                            unit,
                            path: Vec::new(),
                            task: None,
                        });
                        return Ok(());
                    }
                } else {
                    task.state = TaskState::Blocked;
                    task.path.clear();
                    out.proposals.push(PathProposal {
                        unit,
                        path: Vec::new(),
                        task: Some(id),
                    });
                }
            }
        }

        let to = self.tasks.get(id).map(|t| t.state).unwrap_or(from);
        if to != from {
            out.transitions.push(TaskTransition {
                task: id,
                unit,
                from,
                to,
            });
        }
        Ok(())
    }
}

fn goal_reached(goal: Goal, at: TilePos, target: TilePos) -> bool {
    match goal {
        Goal::MoveTo(_) => at == target,
        Goal::Visit(_) => at.manhattan_distance(&target) == 1,
    }
}

/// Drop the walked prefix of `path` up to and including `at`.
fn trim_walked(path: &mut Vec<TilePos>, at: TilePos) {
    if let Some(i) = path.iter().position(|p| *p == at) {
        path.drain(..=i);
    }
}

fn path_still_valid(path: &[TilePos], start: TilePos, view: &dyn PlanView) -> bool {
    let Some(first) = path.first() else {
        return false;
    };
    first.manhattan_distance(&start) == 1 && path.iter().all(|t| view.is_passable(*t))
}

// ---------------------------------------------------------------------------
// A*
// ---------------------------------------------------------------------------

/// A* over the 4-connected grid. Returns the route excluding `start`, or
/// `None` when no route exists within `search_limit` expansions.
pub fn find_path(
    start: TilePos,
    goal: Goal,
    target: TilePos,
    view: &dyn PlanView,
    search_limit: u32,
) -> Option<Vec<TilePos>> {
    let goals: BTreeSet<TilePos> = match goal {
        Goal::MoveTo(tile) => [tile].into_iter().filter(|t| view.is_passable(*t)).collect(),
        Goal::Visit(_) => target
            .neighbors_4()
            .into_iter()
            .filter(|t| view.is_passable(*t))
            .collect(),
    };
    if goals.is_empty() {
        return None;
    }
    let heuristic = |p: TilePos| {
        goals
            .iter()
            .map(|g| p.manhattan_distance(g))
            .min()
            .unwrap_or(0)
    };

    let mut open = BinaryHeap::new();
    let mut best: HashMap<TilePos, u32> = HashMap::new();
    let mut came_from: HashMap<TilePos, TilePos> = HashMap::new();
    let mut closed: BTreeSet<TilePos> = BTreeSet::new();

    best.insert(start, 0);
    open.push(Reverse((heuristic(start), 0u32, start)));

    while let Some(Reverse((_, g, current))) = open.pop() {
        if goals.contains(&current) {
            let mut path = vec![current];
            let mut at = current;
            while let Some(prev) = came_from.get(&at) {
                if *prev == start {
                    break;
                }
                path.push(*prev);
                at = *prev;
            }
            path.reverse();
            return Some(path);
        }
        if !closed.insert(current) {
            continue;
        }
        if closed.len() as u32 > search_limit {
            return None;
        }
        for next in current.neighbors_4() {
            if closed.contains(&next) || !view.is_passable(next) {
                continue;
            }
            let cost = g + 1;
            if best.get(&next).is_none_or(|b| cost < *b) {
                best.insert(next, cost);
                came_from.insert(next, current);
                open.push(Reverse((cost + heuristic(next), cost, next)));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny grid with walls and unit positions.
    struct Grid {
        width: i32,
        height: i32,
        walls: BTreeSet<TilePos>,
        positions: BTreeMap<EntityId, TilePos>,
        stalled: BTreeMap<EntityId, u32>,
    }

    impl Grid {
        fn new(width: i32, height: i32) -> Self {
            Self {
                width,
                height,
                walls: BTreeSet::new(),
                positions: BTreeMap::new(),
                stalled: BTreeMap::new(),
            }
        }
    }

    impl PlanView for Grid {
        fn unit_position(&self, unit: EntityId) -> Option<TilePos> {
            self.positions.get(&unit).copied()
        }
        fn entity_position(&self, entity: EntityId) -> Option<TilePos> {
            self.positions.get(&entity).copied()
        }
        fn is_passable(&self, tile: TilePos) -> bool {
            tile.x >= 0
                && tile.y >= 0
                && tile.x < self.width
                && tile.y < self.height
                && !self.walls.contains(&tile)
        }
        fn stalled_ticks(&self, unit: EntityId) -> u32 {
            self.stalled.get(&unit).copied().unwrap_or(0)
        }
        fn unit_at(&self, tile: TilePos) -> Option<EntityId> {
            self.positions
                .iter()
                .find(|(_, p)| **p == tile)
                .map(|(id, _)| *id)
        }
    }

    const UNIT: EntityId = EntityId(1);

    fn planner() -> Planner {
        Planner::new(PlannerLimits {
            retry_limit: 3,
            search_limit: 1000,
            stall_limit: 4,
        })
    }

    // -----------------------------------------------------------------------
    // A*
    // -----------------------------------------------------------------------

    #[test]
    fn straight_path_excludes_start() {
        let grid = Grid::new(10, 10);
        let path = find_path(
            TilePos::new(0, 0),
            Goal::MoveTo(TilePos::new(3, 0)),
            TilePos::new(3, 0),
            &grid,
            100,
        )
        .unwrap();
        assert_eq!(
            path,
            vec![TilePos::new(1, 0), TilePos::new(2, 0), TilePos::new(3, 0)]
        );
    }

    #[test]
    fn path_routes_around_wall() {
        let mut grid = Grid::new(5, 5);
        for y in 0..4 {
            grid.walls.insert(TilePos::new(2, y));
        }
        let path = find_path(
            TilePos::new(0, 0),
            Goal::MoveTo(TilePos::new(4, 0)),
            TilePos::new(4, 0),
            &grid,
            100,
        )
        .unwrap();
        assert_eq!(path.len(), 12);
        assert!(path.iter().all(|t| !grid.walls.contains(t)));
        assert_eq!(path.last(), Some(&TilePos::new(4, 0)));
    }

    #[test]
    fn sealed_goal_is_unreachable() {
        let mut grid = Grid::new(5, 5);
        for t in TilePos::new(4, 4).neighbors_4() {
            grid.walls.insert(t);
        }
        assert!(find_path(
            TilePos::new(0, 0),
            Goal::MoveTo(TilePos::new(4, 4)),
            TilePos::new(4, 4),
            &grid,
            1000,
        )
        .is_none());
    }

    #[test]
    fn search_limit_bounds_expansion() {
        let grid = Grid::new(100, 100);
        assert!(find_path(
            TilePos::new(0, 0),
            Goal::MoveTo(TilePos::new(99, 99)),
            TilePos::new(99, 99),
            &grid,
            10,
        )
        .is_none());
    }

    #[test]
    fn visit_stops_next_to_target() {
        let mut grid = Grid::new(10, 10);
        grid.walls.insert(TilePos::new(5, 0));
        let path = find_path(
            TilePos::new(0, 0),
            Goal::Visit(EntityId(9)),
            TilePos::new(5, 0),
            &grid,
            100,
        )
        .unwrap();
        assert_eq!(path.last(), Some(&TilePos::new(4, 0)));
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    #[test]
    fn queued_to_active_with_proposal() {
        let mut grid = Grid::new(10, 10);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(2, 0)), 0);
        let out = p.run_slot(&grid, 1);
        assert_eq!(p.state(id), Some(TaskState::Active));
        assert_eq!(out.proposals.len(), 1);
        assert_eq!(out.proposals[0].task, Some(id));
        assert_eq!(out.transitions[0].to, TaskState::Active);
    }

    #[test]
    fn unit_not_in_snapshot_stays_queued() {
        let grid = Grid::new(10, 10);
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(2, 0)), 0);
        p.run_slot(&grid, 1);
        assert_eq!(p.state(id), Some(TaskState::Queued));
    }

    #[test]
    fn reaching_goal_completes() {
        let mut grid = Grid::new(10, 10);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(1, 0)), 0);
        p.run_slot(&grid, 1);
        grid.positions.insert(UNIT, TilePos::new(1, 0));
        p.run_slot(&grid, 2);
        assert_eq!(p.state(id), Some(TaskState::Completed));
    }

    #[test]
    fn blocked_fails_after_retry_limit() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        grid.walls.insert(TilePos::new(4, 4));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(4, 4)), 0);
        p.run_slot(&grid, 1);
        assert_eq!(p.state(id), Some(TaskState::Blocked));
        p.run_slot(&grid, 2);
        p.run_slot(&grid, 3);
        assert_eq!(p.state(id), Some(TaskState::Blocked));
        p.run_slot(&grid, 4);
        assert_eq!(
            p.state(id),
            Some(TaskState::Failed(FailureReason::Unreachable))
        );
    }

    #[test]
    fn blocked_recovers_when_path_opens() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        grid.walls.insert(TilePos::new(4, 4));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(4, 4)), 0);
        p.run_slot(&grid, 1);
        p.run_slot(&grid, 2);
        grid.walls.clear();
        p.run_slot(&grid, 3);
        assert_eq!(p.state(id), Some(TaskState::Active));
        assert_eq!(p.task(id).unwrap().retries, 0);
    }

    #[test]
    fn active_replans_when_path_obstructed() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(3, 0)), 0);
        p.run_slot(&grid, 1);
        grid.walls.insert(TilePos::new(2, 0));
        let out = p.run_slot(&grid, 2);
        assert_eq!(p.state(id), Some(TaskState::Active));
        assert!(!p.task(id).unwrap().path.contains(&TilePos::new(2, 0)));
        assert_eq!(out.proposals.len(), 1);
    }

    #[test]
    fn active_goes_blocked_when_goal_sealed() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(3, 0)), 0);
        p.run_slot(&grid, 1);
        grid.walls.insert(TilePos::new(3, 0));
        let out = p.run_slot(&grid, 2);
        assert_eq!(p.state(id), Some(TaskState::Blocked));
        assert_eq!(out.transitions[0].from, TaskState::Active);
    }

    #[test]
    fn stalled_unit_reroutes_around_other_unit() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let other = EntityId(2);
        grid.positions.insert(other, TilePos::new(1, 0));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(3, 0)), 0);
        p.run_slot(&grid, 1);
        assert!(p.task(id).unwrap().path.contains(&TilePos::new(1, 0)));

        grid.stalled.insert(UNIT, 3);
        let out = p.run_slot(&grid, 2);
        assert!(out.proposals.is_empty());

        grid.stalled.insert(UNIT, 4);
        let out = p.run_slot(&grid, 3);
        assert_eq!(p.state(id), Some(TaskState::Active));
        assert!(out.transitions.is_empty());
        assert_eq!(out.proposals.len(), 1);
        assert!(!out.proposals[0].path.contains(&TilePos::new(1, 0)));
        assert_eq!(out.proposals[0].path.last(), Some(&TilePos::new(3, 0)));
    }

    #[test]
    fn goal_held_by_parked_unit_fails_unreachable() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(1, 0));
        grid.positions.insert(EntityId(2), TilePos::new(3, 0));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(3, 0)), 0);
        p.run_slot(&grid, 1);
        assert_eq!(p.state(id), Some(TaskState::Active));

        grid.stalled.insert(UNIT, 4);
        let out = p.run_slot(&grid, 2);
        assert_eq!(p.state(id), Some(TaskState::Blocked));
        assert_eq!(out.transitions[0].from, TaskState::Active);

        grid.stalled.clear();
        for tick in 3..6 {
            p.run_slot(&grid, tick);
        }
        assert_eq!(
            p.state(id),
            Some(TaskState::Failed(FailureReason::Unreachable))
        );
    }

    #[test]
    fn cancelled_task_never_reactivates() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(3, 0)), 0);
        p.run_slot(&grid, 1);
        let t = p.cancel(id, 1).unwrap().unwrap();
        assert_eq!(t.to, TaskState::Failed(FailureReason::Cancelled));
        assert_eq!(p.advance(id, &grid, 1).unwrap(), t.to);
        // Still inspectable during the tick it finished in.
        p.run_slot(&grid, 1);
        assert!(p.task(id).is_some());
    }

    #[test]
    fn terminal_tasks_reaped_next_tick() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::MoveTo(TilePos::new(3, 0)), 0);
        p.cancel(id, 4).unwrap();
        let out = p.run_slot(&grid, 5);
        assert_eq!(out.reaped, vec![id]);
        assert!(p.task(id).is_none());
        assert_eq!(p.queue(UNIT).count(), 0);
    }

    #[test]
    fn queue_works_head_first() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let mut p = planner();
        let first = p.assign(UNIT, Goal::MoveTo(TilePos::new(2, 0)), 0);
        let second = p.assign(UNIT, Goal::MoveTo(TilePos::new(0, 2)), 0);
        p.run_slot(&grid, 1);
        assert_eq!(p.state(first), Some(TaskState::Active));
        assert_eq!(p.state(second), Some(TaskState::Queued));
    }

    #[test]
    fn visit_target_gone_fails() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let mut p = planner();
        let id = p.assign(UNIT, Goal::Visit(EntityId(42)), 0);
        p.run_slot(&grid, 1);
        assert_eq!(
            p.state(id),
            Some(TaskState::Failed(FailureReason::TargetGone))
        );
    }

    #[test]
    fn reaped_planner_reloads_with_same_next_key() {
        let mut grid = Grid::new(5, 5);
        grid.positions.insert(UNIT, TilePos::new(0, 0));
        let mut p = planner();
        let ids: Vec<_> = (0..4)
            .map(|i| p.assign(UNIT, Goal::MoveTo(TilePos::new(i, 1)), 0))
            .collect();
        p.cancel(ids[2], 0).unwrap();
        p.cancel(ids[0], 0).unwrap();
        p.run_slot(&grid, 1);

        let bytes = bitcode::serialize(&p).unwrap();
        let mut reloaded: Planner = bitcode::deserialize(&bytes).unwrap();
        reloaded.set_limits(p.limits());
        let a = p.assign(UNIT, Goal::MoveTo(TilePos::new(4, 4)), 2);
        let b = reloaded.assign(UNIT, Goal::MoveTo(TilePos::new(4, 4)), 2);
        assert_eq!(a, b);
    }
}

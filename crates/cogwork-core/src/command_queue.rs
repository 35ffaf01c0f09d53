//! Deferred world mutations.
//!
//! Commands are queued from outside the tick and applied in the next
//! tick's pre-tick slot, in submission order. A discarded tick puts its
//! commands back at the front of the queue.

use serde::{Deserialize, Serialize};

use crate::fixed::Ticks;
use crate::id::{EntityId, TaskId};
use crate::placement::Placement;

// ---------------------------------------------------------------------------
// Command enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Validate and create an entity with its links.
    Place(Placement),
    /// Remove an entity, its connections and its tasks.
    Destroy(EntityId),
    /// Fail a task with `Cancelled`.
    CancelTask(TaskId),
    /// Clear an entity's fault so it runs again.
    Repair(EntityId),
}

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    pending: Vec<Command>,
    /// Executed commands with the tick they ran in.
    history: Vec<(Ticks, Command)>,
    /// 0 keeps no history.
    max_history: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the most recent `max_history` executed commands.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            max_history,
            ..Self::default()
        }
    }

    pub fn push(&mut self, command: Command) {
        self.pending.push(command);
    }

    pub fn push_batch(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.pending.extend(commands);
    }

    /// Take every pending command for `tick`, recording them in history.
    pub fn drain(&mut self, tick: Ticks) -> Vec<Command> {
        let commands = std::mem::take(&mut self.pending);
        if self.max_history > 0 {
            self.history
                .extend(commands.iter().map(|cmd| (tick, cmd.clone())));
            let excess = self.history.len().saturating_sub(self.max_history);
            self.history.drain(..excess);
        }
        commands
    }

    /// Undo a [`drain`](Self::drain) for a tick that did not commit.
    /// `commands` go back ahead of anything queued since.
    pub fn requeue(&mut self, tick: Ticks, mut commands: Vec<Command>) {
        self.history.retain(|(t, _)| *t != tick);
        commands.append(&mut self.pending);
        self.pending = commands;
    }

    pub fn pending(&self) -> &[Command] {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn history(&self) -> &[(Ticks, Command)] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destroy(id: u64) -> Command {
        Command::Destroy(EntityId(id))
    }

    #[test]
    fn new_queue_is_empty() {
        let queue = CommandQueue::new();
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_preserves_submission_order() {
        let mut queue = CommandQueue::new();
        queue.push(destroy(1));
        queue.push_batch([destroy(2), Command::Repair(EntityId(3))]);
        let drained = queue.drain(5);
        assert_eq!(
            drained,
            vec![destroy(1), destroy(2), Command::Repair(EntityId(3))]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn no_history_by_default() {
        let mut queue = CommandQueue::new();
        queue.push(destroy(1));
        queue.drain(1);
        assert!(queue.history().is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let mut queue = CommandQueue::with_max_history(2);
        for i in 0..4 {
            queue.push(destroy(i));
            queue.drain(i);
        }
        assert_eq!(queue.history(), &[(2, destroy(2)), (3, destroy(3))]);
        queue.clear_history();
        assert!(queue.history().is_empty());
    }

    #[test]
    fn requeue_puts_commands_back_first() {
        let mut queue = CommandQueue::with_max_history(8);
        queue.push(destroy(1));
        let drained = queue.drain(7);
        queue.push(destroy(2));
        queue.requeue(7, drained);
        assert_eq!(queue.pending(), &[destroy(1), destroy(2)]);
        assert!(queue.history().is_empty());
    }
}

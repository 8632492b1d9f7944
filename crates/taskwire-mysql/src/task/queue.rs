//! FIFO of tasks waiting for the connection.

use std::collections::VecDeque;

use super::Task;

/// Identifier handed out by [`crate::engine::ProtocolEngine::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Tasks in submission order. Only the head may become active.
#[derive(Default)]
pub struct TaskQueue {
    tasks: VecDeque<(TaskId, Task)>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: TaskId, task: Task) {
        self.tasks.push_back((id, task));
    }

    pub fn pop(&mut self) -> Option<(TaskId, Task)> {
        self.tasks.pop_front()
    }

    /// Remove a task that has not started yet.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let index = self.tasks.iter().position(|(queued, _)| *queued == id)?;
        self.tasks.remove(index).map(|(_, task)| task)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.iter().any(|(queued, _)| *queued == id)
    }

    /// Empty the queue, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = (TaskId, Task)> + '_ {
        self.tasks.drain(..)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tasks.iter().map(|(id, task)| (id, task.kind_name())))
            .finish()
    }
}

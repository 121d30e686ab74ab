//! FIFO task queues.
//!
//! Queues only hold handles; the records themselves live in the scheduler's
//! task table. There are no priorities: fairness comes from the time slice
//! apportionment in [`super::runner`], not from queue order.

use std::collections::VecDeque;

use super::task::TaskId;

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    ids: VecDeque<TaskId>,
}

impl TaskQueue {
    pub(crate) fn push(&mut self, id: TaskId) {
        debug_assert!(!self.contains(id), "task {id} queued twice");
        self.ids.push_back(id);
    }

    /// Head of the queue, left in place.
    pub(crate) fn front(&self) -> Option<TaskId> {
        self.ids.front().copied()
    }

    /// Remove `id` wherever it sits. Returns `false` when it was not queued.
    pub(crate) fn remove(&mut self, id: TaskId) -> bool {
        match self.ids.iter().position(|queued| *queued == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.ids.contains(&id)
    }

    pub(crate) fn snapshot(&self) -> Vec<TaskId> {
        self.ids.iter().copied().collect()
    }
}

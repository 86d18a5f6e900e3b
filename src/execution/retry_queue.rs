//! Timer queue for scheduled retries.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::{Instant, sleep_until};

use crate::core::types::TaskId;

/// Min-heap of retries keyed by due time. Ties are broken by scheduling
/// order so equal delays dispatch first-failed-first.
#[derive(Debug, Default)]
pub(crate) struct RetryQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, TaskId)>>,
    seq: u64,
}

impl RetryQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, due: Instant, task_id: TaskId) {
        self.seq += 1;
        self.heap.push(Reverse((due, self.seq, task_id)));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Wait until the earliest retry is due and take it.
    ///
    /// Cancel safe: nothing is removed until the timer has fired.
    pub(crate) async fn next_due(&mut self) -> Option<TaskId> {
        let due = self.heap.peek()?.0.0;
        sleep_until(due).await;
        self.heap.pop().map(|Reverse((_, _, task_id))| task_id)
    }

    /// Remove every scheduled retry, earliest first.
    pub(crate) fn drain(&mut self) -> Vec<TaskId> {
        let mut drained = Vec::with_capacity(self.heap.len());
        while let Some(Reverse((_, _, task_id))) = self.heap.pop() {
            drained.push(task_id);
        }
        drained
    }
}

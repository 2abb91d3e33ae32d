use drum_core::Task;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct QueueItem {
    priority: u32,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        (self.priority, self.seq) == (other.priority, other.seq)
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    // inverted so the max-heap pops the smallest (priority, seq) first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

/// Per-worker task queue: priority ascending (0 is the head), FIFO
/// within a priority. `push` never blocks; the capacity bound is
/// enforced by the Manager before enqueueing.
#[derive(Default)]
pub struct TaskQueue {
    heap: Mutex<(BinaryHeap<QueueItem>, u64)>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, priority: u32, task: Arc<Task>) {
        {
            let mut guard = self.heap.lock().unwrap();
            let seq = guard.1;
            guard.1 += 1;
            guard.0.push(QueueItem { priority, seq, task });
        }
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> (u32, Arc<Task>) {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    fn try_pop(&self) -> Option<(u32, Arc<Task>)> {
        self.heap
            .lock()
            .unwrap()
            .0
            .pop()
            .map(|item| (item.priority, item.task))
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

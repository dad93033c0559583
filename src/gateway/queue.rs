//! Priority queue of key-generation jobs awaiting a worker.
//!
//! Smaller score dequeues first. Score is `(priority, -update_time)` so
//! that, within the same priority, the caller with the most recent
//! `update_time` goes first, matching the floating-point composite
//! score this is an integer-arithmetic stand-in for (see the design
//! notes for why the integer form was chosen).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

pub const MAX_QUEUE: usize = 200;

#[derive(Debug, Clone)]
pub struct Job {
    pub task_id: String,
    pub username: String,
    pub priority: i64,
    pub caller_update_time_epoch: i64,
    pub raw_hex: String,
    pub drone_id: String,
    pub upstream_index: usize,
}

#[derive(Debug)]
struct Scored(Job);

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.score() == other.score()
    }
}
impl Eq for Scored {}

impl Scored {
    fn score(&self) -> (i64, i64) {
        (self.0.priority, -self.0.caller_update_time_epoch)
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest score pops first.
        other.score().cmp(&self.score())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// Bounded priority queue, smallest score dequeues first.
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<Scored>>,
    capacity: usize,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_QUEUE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn enqueue(&self, job: Job) -> Result<(), QueueFull> {
        let mut heap = self.heap.lock();
        if heap.len() >= self.capacity {
            return Err(QueueFull);
        }
        heap.push(Scored(job));
        Ok(())
    }

    pub fn dequeue(&self) -> Option<Job> {
        self.heap.lock().pop().map(|s| s.0)
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(priority: i64, update_time: i64, id: &str) -> Job {
        Job {
            task_id: id.to_string(),
            username: "u".to_string(),
            priority,
            caller_update_time_epoch: update_time,
            raw_hex: String::new(),
            drone_id: "deadbeef".to_string(),
            upstream_index: 0,
        }
    }

    #[test]
    fn dequeues_in_non_decreasing_score_order() {
        let q = PriorityQueue::new();
        q.enqueue(job(5, 100, "a")).unwrap();
        q.enqueue(job(1, 100, "b")).unwrap();
        q.enqueue(job(5, 50, "c")).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.dequeue())
            .map(|j| j.task_id)
            .collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn full_queue_rejects_enqueue() {
        let q = PriorityQueue::new();
        for i in 0..MAX_QUEUE {
            q.enqueue(job(1, i as i64, "x")).unwrap();
        }
        assert_eq!(q.enqueue(job(1, 0, "overflow")), Err(QueueFull));
    }
}

//! Processing set: drones whose key-generation request is currently
//! in flight at an upstream.
//!
//! Bounded FIFO with a per-entry TTL. A concurrent key packet for the
//! same drone while an entry is live is refused by `try_add`, which is
//! how the dispatcher guarantees at most one in-flight key generation
//! per drone.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const CAPACITY: usize = 1024;
const ENTRY_TTL: Duration = Duration::from_secs(36);

#[derive(Debug, Clone)]
pub struct ProcessingEntry {
    pub upstream_index: usize,
    pub started_at: Instant,
}

struct Inner {
    entries: HashMap<String, ProcessingEntry>,
    order: VecDeque<String>,
}

/// FIFO TTL set of drone ids currently undergoing key generation, capped at 1024.
pub struct ProcessingSet {
    inner: Mutex<Inner>,
}

impl ProcessingSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Attempts to register `drone_id` as processing on `upstream_index`.
    /// Purges expired entries first. Returns `false` if the drone already
    /// has a live entry.
    pub fn try_add(&self, drone_id: String, upstream_index: usize) -> bool {
        let mut inner = self.inner.lock();
        purge_expired(&mut inner);

        if inner.entries.contains_key(&drone_id) {
            return false;
        }

        if inner.entries.len() >= CAPACITY {
            if let Some(eldest) = inner.order.pop_front() {
                inner.entries.remove(&eldest);
            }
        }

        inner.order.push_back(drone_id.clone());
        inner.entries.insert(
            drone_id,
            ProcessingEntry {
                upstream_index,
                started_at: Instant::now(),
            },
        );
        true
    }

    /// Idempotent removal, used both on normal completion and rollback.
    pub fn remove(&self, drone_id: &str) {
        let mut inner = self.inner.lock();
        inner.entries.remove(drone_id);
        inner.order.retain(|id| id != drone_id);
    }

    /// Looks up a live entry, purging expired entries first.
    pub fn lookup(&self, drone_id: &str) -> Option<ProcessingEntry> {
        let mut inner = self.inner.lock();
        purge_expired(&mut inner);
        inner.entries.get(drone_id).cloned()
    }
}

impl Default for ProcessingSet {
    fn default() -> Self {
        Self::new()
    }
}

fn purge_expired(inner: &mut Inner) {
    let now = Instant::now();
    let expired: Vec<String> = inner
        .entries
        .iter()
        .filter(|(_, e)| now.duration_since(e.started_at) >= ENTRY_TTL)
        .map(|(id, _)| id.clone())
        .collect();

    for id in expired {
        inner.entries.remove(&id);
        inner.order.retain(|o| o != &id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_add_rejected_while_live() {
        let set = ProcessingSet::new();
        assert!(set.try_add("abc".into(), 0));
        assert!(!set.try_add("abc".into(), 1));
    }

    #[test]
    fn remove_then_add_succeeds() {
        let set = ProcessingSet::new();
        assert!(set.try_add("abc".into(), 0));
        set.remove("abc");
        assert!(set.try_add("abc".into(), 1));
    }

    #[test]
    fn evicts_eldest_at_capacity() {
        let set = ProcessingSet::new();
        for i in 0..CAPACITY {
            assert!(set.try_add(format!("{i:08x}"), 0));
        }
        assert!(set.try_add("overflow".into(), 0));
        assert_eq!(set.len(), CAPACITY);
        assert!(set.lookup("00000000").is_none());
    }
}

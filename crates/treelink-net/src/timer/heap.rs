//! Min-heap timer storage with lazy cancellation.
//!
//! Cancelled handles go into a set and are skipped at poll time, keeping
//! cancel O(1); the set is emptied whenever the heap drains.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use super::entry::{TimerEntry, TimerEvent, TimerHandle};

/// Wrapper inverting the ordering so the `BinaryHeap` pops the earliest
/// deadline first, with the handle as a deterministic tie-break.
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.handle == other.0.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.handle.raw().cmp(&self.0.handle.raw()),
            ord => ord,
        }
    }
}

struct HeapInner {
    heap: BinaryHeap<HeapEntry>,
    cancelled: HashSet<TimerHandle>,
}

/// Shared timer storage polled by the dispatch thread.
pub struct TimerHeap {
    inner: Mutex<HeapInner>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                heap: BinaryHeap::with_capacity(32),
                cancelled: HashSet::new(),
            }),
        }
    }

    /// Insert an entry; its handle cancels it.
    pub fn insert(&self, entry: TimerEntry) -> TimerHandle {
        let handle = entry.handle;
        let mut inner = self.inner.lock().unwrap();
        inner.heap.push(HeapEntry(entry));
        handle
    }

    /// Best-effort cancel; returns false if the handle already fired or was
    /// already cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled.insert(handle)
    }

    /// Pop every entry due at `now`, re-arming periodic ones.
    pub fn poll_expired(&self, now: Instant) -> Vec<TimerEvent> {
        let mut inner = self.inner.lock().unwrap();
        let mut expired = Vec::new();
        let mut reschedule = Vec::new();

        while let Some(front) = inner.heap.peek() {
            if front.0.deadline > now {
                break;
            }
            let entry = inner.heap.pop().unwrap().0;
            if inner.cancelled.remove(&entry.handle) {
                continue;
            }
            if let Some(next) = entry.reschedule() {
                reschedule.push(next);
            }
            expired.push(entry.event);
        }

        for entry in reschedule {
            inner.heap.push(HeapEntry(entry));
        }
        if inner.heap.is_empty() {
            inner.cancelled.clear();
        }
        expired
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner.heap.peek().map(|e| e.0.deadline)
    }

    /// Live entries (cancelled ones excluded).
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.heap.len().saturating_sub(inner.cancelled.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

//! Outbound frame queue.
//!
//! Validated, checksum-stamped frames are pushed here by handlers and the
//! send API; a single consumer thread (owned by the node) drains them to
//! the radio. Pushing never blocks: a full queue drops the frame. The
//! consumer parks on a Condvar while the queue is empty.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use treelink_core::frame::Wire;

/// Condvar-based park/wake pair for the consumer thread.
pub(crate) struct Parking {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl Parking {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Sleep until woken or `timeout` elapses. A wake that raced ahead of
    /// the park is consumed instead of lost.
    pub fn park(&self, timeout: Duration) {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            let (guard, _) = self.cv.wait_timeout(pending, timeout).unwrap();
            pending = guard;
        }
        *pending = false;
    }

    pub fn wake(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cv.notify_one();
    }
}

/// Bounded queue of encoded frames awaiting transmission.
pub(crate) struct Outbound {
    queue: ArrayQueue<Wire>,
    parking: Parking,
}

impl Outbound {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            parking: Parking::new(),
        }
    }

    /// Enqueue and wake the consumer; false when full (frame dropped).
    pub fn push(&self, wire: Wire) -> bool {
        let ok = self.queue.push(wire).is_ok();
        if ok {
            self.parking.wake();
        }
        ok
    }

    pub fn pop(&self) -> Option<Wire> {
        self.queue.pop()
    }

    /// Park the consumer until work arrives or the timeout passes.
    pub fn wait_for_work(&self, timeout: Duration) {
        self.parking.park(timeout);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Wake the consumer thread without enqueuing a frame (used to force
    /// it to notice a shutdown request promptly).
    pub fn wake(&self) {
        self.parking.wake();
    }
}

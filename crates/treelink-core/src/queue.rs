//! Bounded MPMC queue for inbound application traffic.
//!
//! The producer side never blocks: [`Sender::try_send`] drops the item and
//! reports failure when the queue is full. The consumer side supports the
//! three wait modes of the receive API: block forever, poll, or wait with a
//! deadline. Waiting is Condvar-based so blocked application tasks consume
//! no CPU.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Create a bounded queue with the given capacity.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        available: Condvar::new(),
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// Returned by [`Sender::try_send`] when the queue is full; carries the
/// rejected item back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFull<T>(pub T);

/// Returned by [`Receiver::recv`] when the wait mode expires empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvTimeout;

struct Shared<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    available: Condvar,
}

/// Producing half; cheap to clone.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

/// Consuming half; cheap to clone.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Enqueue without blocking; a full queue rejects the item.
    pub fn try_send(&self, value: T) -> Result<(), QueueFull<T>> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.len() >= self.shared.capacity {
                return Err(QueueFull(value));
            }
            inner.push_back(value);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Receiver<T> {
    /// Dequeue one item.
    ///
    /// `timeout` selects the wait mode: `None` blocks until an item
    /// arrives, `Some(Duration::ZERO)` polls, and any other duration waits
    /// at most that long.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, RecvTimeout> {
        let mut inner = self.shared.inner.lock().unwrap();

        match timeout {
            None => loop {
                if let Some(v) = inner.pop_front() {
                    return Ok(v);
                }
                inner = self.shared.available.wait(inner).unwrap();
            },
            Some(limit) if limit.is_zero() => inner.pop_front().ok_or(RecvTimeout),
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    if let Some(v) = inner.pop_front() {
                        return Ok(v);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RecvTimeout);
                    }
                    let (guard, _) = self
                        .shared
                        .available
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                }
            }
        }
    }

    /// Dequeue without blocking.
    pub fn try_recv(&self) -> Option<T> {
        self.shared.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver {
            shared: Arc::clone(&self.shared),
        }
    }
}

//! Timer subsystem: one dispatch thread, serial callbacks.
//!
//! All of a node's timers fire on a single dedicated thread, so handlers
//! never race each other. Handlers must not block: they push frames to the
//! non-blocking outbound queue and take the node mutex only briefly.
//!
//! ```text
//!   schedule_once / schedule_periodic / cancel
//!                    │
//!                    ▼
//!               TimerHeap (min-heap, lazy cancel)
//!                    │  poll_expired()
//!                    ▼
//!          dispatch thread ──► TimerDispatch::on_timer(event)
//! ```

mod entry;
mod heap;

pub use entry::{TimerEntry, TimerEvent, TimerHandle, TimerKind};
pub use heap::TimerHeap;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Receiver of expired timer events; the node state machine implements
/// this.
pub trait TimerDispatch: Send + Sync {
    fn on_timer(&self, event: TimerEvent);
}

/// Upper bound between polls when the next deadline is far away.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lower bound preventing busy-spinning on an imminent deadline.
const MIN_SLEEP: Duration = Duration::from_micros(200);

/// Handle to a node's timer service.
pub struct TimerService {
    heap: Arc<TimerHeap>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Spawn the dispatch thread. `name` tags the thread for diagnostics.
    pub fn start(name: &str, dispatch: Arc<dyn TimerDispatch>) -> TimerService {
        let heap = Arc::new(TimerHeap::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let heap = Arc::clone(&heap);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || dispatch_loop(heap, dispatch, shutdown))
                .expect("failed to spawn timer thread")
        };

        TimerService {
            heap,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Arm a single-shot timer.
    pub fn schedule_once(&self, delay: Duration, event: TimerEvent) -> TimerHandle {
        self.heap.insert(TimerEntry::once(event, delay))
    }

    /// Arm a periodic timer.
    pub fn schedule_periodic(&self, interval: Duration, event: TimerEvent) -> TimerHandle {
        self.heap.insert(TimerEntry::periodic(event, interval))
    }

    /// Best-effort cancel; the entry may already have fired.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.heap.cancel(handle)
    }

    /// Pending (non-cancelled) timers.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Stop the dispatch thread. Joins unless called from the dispatch
    /// thread itself (a restart hook runs there), in which case the thread
    /// is left to exit on its own.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(h) = self.worker.lock().unwrap().take() {
            if h.thread().id() != thread::current().id() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(heap: Arc<TimerHeap>, dispatch: Arc<dyn TimerDispatch>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        for event in heap.poll_expired(Instant::now()) {
            dispatch.on_timer(event);
        }
        thread::sleep(sleep_until_next(&heap));
    }
}

/// Sleep until the next deadline, clamped to [MIN_SLEEP, MAX_POLL_INTERVAL].
fn sleep_until_next(heap: &TimerHeap) -> Duration {
    match heap.next_deadline() {
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                MIN_SLEEP
            } else {
                (deadline - now).min(MAX_POLL_INTERVAL).max(MIN_SLEEP)
            }
        }
        None => MAX_POLL_INTERVAL,
    }
}

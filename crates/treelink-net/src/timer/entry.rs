//! Timer entries, handles and the events they deliver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Unique handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    /// Allocate a fresh, process-unique handle.
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// What a firing timer means to the node.
///
/// All network timers are single-shot; the handlers re-arm where the
/// protocol calls for it. Application ticks are the one periodic kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Time for an unlinked node to broadcast a Locate round.
    Join,

    /// The locate collection window closed; pick a responder.
    LocateCollect,

    /// Our link proposal went unconfirmed; forget the proposer.
    PendingLink,

    /// Time to probe the upstream link with a Status frame.
    UpstreamProbe,

    /// No Status reply from upstream; the uplink is considered lost.
    StatusTimeout,

    /// A downstream link's decay window elapsed without a Status.
    LinkDecay(usize),

    /// Periodic tick for the application with this id.
    AppTick(u16),
}

/// Firing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fire once and forget.
    Once,
    /// Re-arm with `interval` after each firing.
    Periodic { interval: Duration },
}

/// A scheduled timer in the backend heap.
#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub handle: TimerHandle,
    pub deadline: Instant,
    pub event: TimerEvent,
    pub kind: TimerKind,
}

impl TimerEntry {
    /// Single-shot entry due after `delay`.
    pub fn once(event: TimerEvent, delay: Duration) -> Self {
        Self {
            handle: TimerHandle::new(),
            deadline: Instant::now() + delay,
            event,
            kind: TimerKind::Once,
        }
    }

    /// Periodic entry firing every `interval`.
    pub fn periodic(event: TimerEvent, interval: Duration) -> Self {
        Self {
            handle: TimerHandle::new(),
            deadline: Instant::now() + interval,
            event,
            kind: TimerKind::Periodic { interval },
        }
    }

    /// Follow-up entry for a periodic timer, with a fresh handle.
    pub fn reschedule(&self) -> Option<Self> {
        match self.kind {
            TimerKind::Periodic { interval } => Some(Self {
                handle: TimerHandle::new(),
                deadline: Instant::now() + interval,
                event: self.event,
                kind: self.kind,
            }),
            TimerKind::Once => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_uniqueness() {
        let handles: Vec<_> = (0..1000).map(|_| TimerHandle::new()).collect();
        let unique: std::collections::HashSet<_> = handles.iter().collect();
        assert_eq!(unique.len(), handles.len());
    }

    #[test]
    fn test_once_does_not_reschedule() {
        let e = TimerEntry::once(TimerEvent::Join, Duration::from_millis(10));
        assert!(e.reschedule().is_none());
    }

    #[test]
    fn test_periodic_reschedules_with_new_handle() {
        let e = TimerEntry::periodic(TimerEvent::AppTick(10), Duration::from_millis(50));
        let next = e.reschedule().expect("periodic reschedules");
        assert_eq!(next.event, e.event);
        assert_ne!(next.handle, e.handle);
    }
}

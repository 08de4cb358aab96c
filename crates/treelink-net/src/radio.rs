//! The radio seam.
//!
//! Everything below the frame codec is behind this trait: the node state
//! machine neither knows nor cares whether frames travel over real RF or
//! the in-process [`crate::sim::SimHub`]. The peer-list calls mirror radios
//! that require explicit unicast peers; implementations without that notion
//! may treat them as no-ops.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use treelink_core::id::Mac;
use treelink_core::{NetError, NetResult};

/// Callback invoked for every received datagram, on a radio-owned thread.
pub type RecvHandler = Box<dyn Fn(&Mac, &[u8]) + Send + Sync>;

/// Datagram radio abstraction.
pub trait Radio: Send + Sync {
    /// This radio's own physical address.
    fn local_mac(&self) -> Mac;

    /// Install the receive callback. Called once at node start.
    fn start_receive(&self, handler: RecvHandler);

    /// Transmit one datagram. Best-effort; an error means the radio itself
    /// rejected the send, not that delivery failed.
    fn send(&self, dest: &Mac, frame: &[u8]) -> NetResult<()>;

    /// Allow unicast transmissions to `mac`.
    fn add_peer(&self, mac: &Mac);

    /// Drop `mac` from the unicast peer list.
    fn remove_peer(&self, mac: &Mac);
}

/// Radio double that records every operation and delivers nothing.
///
/// Protocol tests drive the node by injecting frames straight into its
/// receive path and assert on what was transmitted here.
pub struct RecordingRadio {
    mac: Mac,
    sent: Mutex<Vec<(Mac, Vec<u8>)>>,
    peers: Mutex<Vec<Mac>>,
    sent_cv: Condvar,
}

impl RecordingRadio {
    pub fn new(mac: Mac) -> Self {
        Self {
            mac,
            sent: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            sent_cv: Condvar::new(),
        }
    }

    /// Snapshot of every `(destination, frame)` transmitted so far.
    pub fn sent(&self) -> Vec<(Mac, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// Forget recorded transmissions.
    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Current unicast peer list.
    pub fn peers(&self) -> Vec<Mac> {
        self.peers.lock().unwrap().clone()
    }

    /// Block until at least `count` frames have been transmitted, or the
    /// timeout passes. Returns whether the count was reached.
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut sent = self.sent.lock().unwrap();
        while sent.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.sent_cv.wait_timeout(sent, deadline - now).unwrap();
            sent = guard;
        }
        true
    }
}

impl Radio for RecordingRadio {
    fn local_mac(&self) -> Mac {
        self.mac
    }

    fn start_receive(&self, _handler: RecvHandler) {}

    fn send(&self, dest: &Mac, frame: &[u8]) -> NetResult<()> {
        self.sent.lock().unwrap().push((*dest, frame.to_vec()));
        self.sent_cv.notify_all();
        Ok(())
    }

    fn add_peer(&self, mac: &Mac) {
        let mut peers = self.peers.lock().unwrap();
        if !peers.contains(mac) {
            peers.push(*mac);
        }
    }

    fn remove_peer(&self, mac: &Mac) {
        self.peers.lock().unwrap().retain(|m| m != mac);
    }
}

/// Radio double that fails every send, for exercising the error path.
pub struct DeadRadio {
    mac: Mac,
}

impl DeadRadio {
    pub fn new(mac: Mac) -> Self {
        Self { mac }
    }
}

impl Radio for DeadRadio {
    fn local_mac(&self) -> Mac {
        self.mac
    }

    fn start_receive(&self, _handler: RecvHandler) {}

    fn send(&self, _dest: &Mac, _frame: &[u8]) -> NetResult<()> {
        Err(NetError::RadioFailure)
    }

    fn add_peer(&self, _mac: &Mac) {}

    fn remove_peer(&self, _mac: &Mac) {}
}

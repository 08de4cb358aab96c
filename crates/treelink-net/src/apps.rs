//! Application registry: app id to bounded inbound queue.
//!
//! 32 fixed slots behind one mutex; registration and lookup are both brief
//! critical sections. Each slot owns both halves of its queue: the
//! receiver/dispatcher clones the sender, application tasks clone the
//! receiver.

use std::sync::Mutex;

use treelink_core::frame::{AppHeader, Direction};
use treelink_core::queue::{bounded, Receiver, Sender};
use treelink_core::{NetError, NetResult};

/// Maximum registered applications per node.
pub const APP_TABLE_SIZE: usize = 32;

/// One dequeued application message.
///
/// `dir` is the arrival direction the receiver recorded at dispatch; the
/// wire's reserved bytes stay untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub header: AppHeader,
    pub dir: Direction,
    pub payload: Vec<u8>,
}

struct AppSlot {
    id: u16,
    tx: Sender<Inbound>,
    rx: Receiver<Inbound>,
}

/// Fixed-size registry of application queues.
pub struct AppTable {
    slots: Mutex<[Option<AppSlot>; APP_TABLE_SIZE]>,
}

impl AppTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    /// Create an inbound queue for `app_id`. At most one queue per id.
    pub fn register(&self, app_id: u16, queue_capacity: usize) -> NetResult<()> {
        if app_id == 0 {
            return Err(NetError::InvalidArgument);
        }
        let mut slots = self.slots.lock().unwrap();

        let mut free = None;
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Some(s) if s.id == app_id => return Err(NetError::AlreadyRegistered),
                Some(_) => {}
                None => {
                    if free.is_none() {
                        free = Some(i);
                    }
                }
            }
        }
        let free = free.ok_or(NetError::TableFull)?;

        let (tx, rx) = bounded(queue_capacity);
        slots[free] = Some(AppSlot { id: app_id, tx, rx });
        Ok(())
    }

    /// Producer handle for the receiver/dispatcher.
    pub fn sender(&self, app_id: u16) -> Option<Sender<Inbound>> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .find(|s| s.id == app_id)
            .map(|s| s.tx.clone())
    }

    /// Consumer handle for the application task.
    pub fn receiver(&self, app_id: u16) -> Option<Receiver<Inbound>> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .find(|s| s.id == app_id)
            .map(|s| s.rx.clone())
    }

    /// Registered application count.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AppTable {
    fn default() -> Self {
        Self::new()
    }
}

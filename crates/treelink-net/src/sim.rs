//! In-process radio domain for simulations and scenario tests.
//!
//! A [`SimHub`] models one shared broadcast medium: every endpoint hears
//! broadcast frames, unicast frames reach their addressee when the sender
//! has added it as a peer. Delivery happens on the hub's own thread so
//! receive callbacks run in a background context, exactly as they would on
//! radio hardware. The delivery queue is bounded and drop-on-full; the
//! medium is allowed to lose frames.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use treelink_core::id::Mac;
use treelink_core::{logw, NetError, NetResult};

use crate::radio::{Radio, RecvHandler};

const TAG: &str = "sim";

/// Delivery queue depth. Bigger than any burst the protocols produce.
const HUB_QUEUE_SIZE: usize = 256;

/// Wire tap invoked for every routed frame `(source, destination, bytes)`.
pub type Tap = Box<dyn Fn(&Mac, &Mac, &[u8]) + Send + Sync>;

struct Endpoint {
    handler: Option<Arc<RecvHandler>>,
    peers: HashSet<Mac>,
}

struct Delivery {
    src: Mac,
    dest: Mac,
    bytes: Vec<u8>,
}

/// One simulated radio domain.
pub struct SimHub {
    endpoints: Mutex<HashMap<Mac, Endpoint>>,
    taps: Mutex<Vec<Tap>>,
    queue: ArrayQueue<Delivery>,
    wakeup: Mutex<bool>,
    wakeup_cv: Condvar,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimHub {
    /// Create the hub and spawn its delivery thread.
    pub fn start() -> Arc<SimHub> {
        let hub = Arc::new(SimHub {
            endpoints: Mutex::new(HashMap::new()),
            taps: Mutex::new(Vec::new()),
            queue: ArrayQueue::new(HUB_QUEUE_SIZE),
            wakeup: Mutex::new(false),
            wakeup_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&hub);
        let handle = thread::Builder::new()
            .name("sim-hub".into())
            .spawn(move || loop {
                let Some(hub) = weak.upgrade() else { break };
                if hub.shutdown.load(Ordering::Acquire) {
                    break;
                }
                match hub.queue.pop() {
                    Some(delivery) => hub.deliver(delivery),
                    None => hub.park(Duration::from_millis(20)),
                }
            })
            .expect("failed to spawn hub thread");
        *hub.worker.lock().unwrap() = Some(handle);
        hub
    }

    /// Register a radio endpoint with the given address.
    pub fn endpoint(self: &Arc<Self>, mac: Mac) -> SimRadio {
        self.endpoints.lock().unwrap().insert(
            mac,
            Endpoint {
                handler: None,
                peers: HashSet::new(),
            },
        );
        SimRadio {
            hub: Arc::clone(self),
            mac,
        }
    }

    /// Observe every frame crossing the medium.
    pub fn add_tap(&self, tap: Tap) {
        self.taps.lock().unwrap().push(tap);
    }

    /// Stop the delivery thread. Queued frames are lost, like any frames
    /// in flight when a radio powers off.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
        if let Some(h) = self.worker.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    fn route(&self, src: Mac, dest: Mac, bytes: &[u8]) -> NetResult<()> {
        {
            let endpoints = self.endpoints.lock().unwrap();
            let ep = endpoints.get(&src).ok_or(NetError::RadioFailure)?;
            if !dest.is_broadcast() && !ep.peers.contains(&dest) {
                return Err(NetError::RadioFailure);
            }
        }
        for tap in self.taps.lock().unwrap().iter() {
            tap(&src, &dest, bytes);
        }
        if self
            .queue
            .push(Delivery {
                src,
                dest,
                bytes: bytes.to_vec(),
            })
            .is_err()
        {
            logw!(TAG, "delivery queue full, frame lost");
        }
        self.wake();
        Ok(())
    }

    fn deliver(&self, delivery: Delivery) {
        let handlers: Vec<Arc<RecvHandler>> = {
            let endpoints = self.endpoints.lock().unwrap();
            if delivery.dest.is_broadcast() {
                endpoints
                    .iter()
                    .filter(|(mac, _)| **mac != delivery.src)
                    .filter_map(|(_, ep)| ep.handler.clone())
                    .collect()
            } else {
                endpoints
                    .get(&delivery.dest)
                    .and_then(|ep| ep.handler.clone())
                    .into_iter()
                    .collect()
            }
        };
        for handler in handlers {
            (*handler)(&delivery.src, &delivery.bytes);
        }
    }

    fn wake(&self) {
        let mut pending = self.wakeup.lock().unwrap();
        *pending = true;
        self.wakeup_cv.notify_one();
    }

    fn park(&self, timeout: Duration) {
        let mut pending = self.wakeup.lock().unwrap();
        if !*pending {
            let (guard, _) = self.wakeup_cv.wait_timeout(pending, timeout).unwrap();
            pending = guard;
        }
        *pending = false;
    }
}

/// One endpoint's handle onto the hub.
pub struct SimRadio {
    hub: Arc<SimHub>,
    mac: Mac,
}

impl Radio for SimRadio {
    fn local_mac(&self) -> Mac {
        self.mac
    }

    fn start_receive(&self, handler: RecvHandler) {
        if let Some(ep) = self.hub.endpoints.lock().unwrap().get_mut(&self.mac) {
            ep.handler = Some(Arc::new(handler));
        }
    }

    fn send(&self, dest: &Mac, frame: &[u8]) -> NetResult<()> {
        self.hub.route(self.mac, *dest, frame)
    }

    fn add_peer(&self, mac: &Mac) {
        if let Some(ep) = self.hub.endpoints.lock().unwrap().get_mut(&self.mac) {
            ep.peers.insert(*mac);
        }
    }

    fn remove_peer(&self, mac: &Mac) {
        if let Some(ep) = self.hub.endpoints.lock().unwrap().get_mut(&self.mac) {
            ep.peers.remove(mac);
        }
    }
}

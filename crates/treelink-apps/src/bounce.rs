//! Bounce: a hop-counting echo over the tree.
//!
//! Packets carry a counter and a life bound. On every tick the node drains
//! its inbound queue; each packet with the right magic gets its counter
//! incremented and the local node id stamped in, and is re-emitted in the
//! direction it arrived from, until the counter exceeds the life. Watching
//! the counters on the wire shows a message ping-ponging across a branch
//! of the tree.

use std::sync::{Arc, Weak};
use std::time::Duration;

use treelink_core::frame::Direction;
use treelink_core::{loge, logi, logw, NetError, NetResult};
use treelink_net::stack::NetStack;

const TAG: &str = "bounce";

/// Registered application id.
pub const APP_BOUNCE_ID: u16 = 10;

/// Message text capacity, terminator included.
pub const BOUNCE_TEXT_MAX: usize = 115;

/// Minimum tick cycle.
pub const BOUNCE_MIN_CYCLE: Duration = Duration::from_millis(500);

const BOUNCE_MAGIC: u32 = 0x0A00_1B11;

/// Fixed fields ahead of the text: magic, counter, life, node id.
const BOUNCE_FIXED_LEN: usize = 13;

/// One bounce message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BouncePacket {
    pub counter: u32,
    pub life: u32,
    pub node_id: u8,
    pub text: String,
}

impl BouncePacket {
    /// Serialize: magic, counter and life little-endian, node id, then the
    /// NUL-terminated text.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BOUNCE_FIXED_LEN + self.text.len() + 1);
        out.extend_from_slice(&BOUNCE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.counter.to_le_bytes());
        out.extend_from_slice(&self.life.to_le_bytes());
        out.push(self.node_id);
        out.extend_from_slice(self.text.as_bytes());
        out.push(0);
        out
    }

    /// Parse a payload; `None` when the magic or length is wrong.
    pub fn decode(payload: &[u8]) -> Option<BouncePacket> {
        if payload.len() <= BOUNCE_FIXED_LEN {
            return None;
        }
        let magic = u32::from_le_bytes(payload[0..4].try_into().ok()?);
        if magic != BOUNCE_MAGIC {
            return None;
        }
        let counter = u32::from_le_bytes(payload[4..8].try_into().ok()?);
        let life = u32::from_le_bytes(payload[8..12].try_into().ok()?);
        let node_id = payload[12];
        let text_bytes = &payload[BOUNCE_FIXED_LEN..];
        let end = text_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(text_bytes.len());
        let text = String::from_utf8_lossy(&text_bytes[..end]).into_owned();
        Some(BouncePacket {
            counter,
            life,
            node_id,
            text,
        })
    }
}

/// The bounce application on one node.
pub struct Bounce {
    stack: Weak<NetStack>,
    node_id: u8,
}

impl Bounce {
    /// Register the app and arm its periodic tick.
    pub fn init(stack: &Arc<NetStack>, cycle: Duration) -> NetResult<Arc<Bounce>> {
        if cycle < BOUNCE_MIN_CYCLE {
            loge!(TAG, "invalid cycle time, must be at least {:?}", BOUNCE_MIN_CYCLE);
            return Err(NetError::InvalidArgument);
        }
        stack.register_app(APP_BOUNCE_ID)?;

        let app = Arc::new(Bounce {
            stack: Arc::downgrade(stack),
            node_id: stack.node_id(),
        });
        let ticker = Arc::clone(&app);
        stack.register_tick(APP_BOUNCE_ID, cycle, Arc::new(move || ticker.tick()));

        logi!(TAG, "Initialized bounce application.");
        Ok(app)
    }

    /// Inject a fresh message toward the parent.
    pub fn send_up(&self, text: &str, life: u32) -> NetResult<()> {
        self.inject(text, life, true)
    }

    /// Inject a fresh message toward the children.
    pub fn send_down(&self, text: &str, life: u32) -> NetResult<()> {
        self.inject(text, life, false)
    }

    fn inject(&self, text: &str, life: u32, up: bool) -> NetResult<()> {
        if text.len() >= BOUNCE_TEXT_MAX {
            loge!(TAG, "cannot add message -- too long");
            return Err(NetError::InvalidArgument);
        }
        if life == 0 {
            loge!(TAG, "cannot add message -- no lifespan");
            return Err(NetError::InvalidArgument);
        }
        let stack = self.stack.upgrade().ok_or(NetError::Halted)?;

        let pkt = BouncePacket {
            counter: 0,
            life,
            node_id: self.node_id,
            text: text.to_string(),
        };
        let payload = pkt.encode();
        let head = treelink_core::frame::AppHeader::new(APP_BOUNCE_ID, payload.len() as u8);
        if up {
            stack.send_up(&head, &payload)
        } else {
            stack.send_down(&head, &payload)
        }
    }

    /// Drain the inbound queue and re-emit live packets in their arrival
    /// direction. Runs on the shared timer thread; never blocks.
    pub fn tick(&self) {
        let Some(stack) = self.stack.upgrade() else {
            return;
        };
        while let Ok(msg) = stack.receive(APP_BOUNCE_ID, Some(Duration::ZERO)) {
            let Some(mut pkt) = BouncePacket::decode(&msg.payload) else {
                continue;
            };
            logi!(TAG, "[node 0x{:02X} i {}] {}", pkt.node_id, pkt.counter, pkt.text);

            pkt.counter += 1;
            pkt.node_id = self.node_id;

            if pkt.counter <= pkt.life {
                let payload = pkt.encode();
                let head =
                    treelink_core::frame::AppHeader::new(APP_BOUNCE_ID, payload.len() as u8);
                let result = match msg.dir {
                    Direction::FromUpstream => stack.send_up(&head, &payload),
                    Direction::FromDownstream => stack.send_down(&head, &payload),
                };
                if let Err(e) = result {
                    logw!(TAG, "re-emit failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use treelink_core::frame::{ControlCode, NetFrame, AppHeader};
    use treelink_core::id::Mac;
    use treelink_core::logging::{set_log_level, LogLevel};
    use treelink_core::NODE_BROADCAST;
    use treelink_net::config::NetConfig;
    use treelink_net::radio::RecordingRadio;

    const MAC_A: Mac = Mac([0xAA; 6]);
    const MAC_B: Mac = Mac([0xBB; 6]);

    fn fast_config() -> NetConfig {
        NetConfig {
            period_locate: Duration::from_millis(40),
            window_locate: Duration::from_millis(20),
            timeout_locate: Duration::from_millis(80),
            timeout_propose_link: Duration::from_millis(150),
            timeout_status: Duration::from_millis(80),
            timeout_link_decay: Duration::from_secs(10),
            period_up_status: Duration::from_secs(30),
            window_up_status: Duration::from_millis(50),
            window_send: Duration::ZERO,
            blackout_pause: Duration::from_millis(30),
            outbound_capacity: 16,
            inbound_capacity: 6,
        }
    }

    fn wait_until<F: Fn() -> bool>(pred: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    /// Root stack with a confirmed downlink to 0x17 behind MAC_B.
    fn root_with_child(radio: &Arc<RecordingRadio>) -> Arc<NetStack> {
        let a = NetStack::new(0x16, true, fast_config(), radio.clone()).unwrap();
        let mut loc = NetFrame::control_frame(0x17, NODE_BROADCAST, ControlCode::Locate);
        loc.reserved[0] = 1;
        a.handle_frame(&MAC_B, &loc.encode());
        assert!(wait_until(
            || radio
                .sent()
                .iter()
                .filter_map(|(_, b)| NetFrame::parse(b).ok())
                .any(|f| f.control == ControlCode::Link),
            Duration::from_secs(2)
        ));
        let mut confirm = NetFrame::control_frame(0x17, 0x16, ControlCode::Link);
        confirm.reserved[0] = 1;
        a.handle_frame(&MAC_B, &confirm.encode());
        assert!(wait_until(
            || !a.downstream().is_empty(),
            Duration::from_secs(2)
        ));
        a
    }

    fn bounce_frames(radio: &RecordingRadio) -> Vec<BouncePacket> {
        radio
            .sent()
            .iter()
            .filter_map(|(_, b)| NetFrame::parse(b).ok())
            .filter(|f| f.control == ControlCode::Default && f.app_header().app_id == APP_BOUNCE_ID)
            .filter_map(|f| BouncePacket::decode(f.app_payload()))
            .collect()
    }

    #[test]
    fn test_packet_round_trip() {
        let pkt = BouncePacket {
            counter: 2,
            life: 5,
            node_id: 0x17,
            text: "hello there".to_string(),
        };
        let payload = pkt.encode();
        assert_eq!(payload.len(), BOUNCE_FIXED_LEN + 11 + 1);
        assert_eq!(BouncePacket::decode(&payload), Some(pkt));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(BouncePacket::decode(&[]), None);
        assert_eq!(BouncePacket::decode(&[0u8; 20]), None);
        let mut payload = BouncePacket {
            counter: 0,
            life: 1,
            node_id: 1,
            text: "x".into(),
        }
        .encode();
        payload[0] ^= 0xFF;
        assert_eq!(BouncePacket::decode(&payload), None);
    }

    #[test]
    fn test_init_validates_cycle() {
        set_log_level(LogLevel::Off);
        let radio = Arc::new(RecordingRadio::new(MAC_A));
        let a = NetStack::new(0x16, true, fast_config(), radio).unwrap();
        assert_eq!(
            Bounce::init(&a, Duration::from_millis(100)).err(),
            Some(NetError::InvalidArgument)
        );
        // A valid cycle registers the app.
        Bounce::init(&a, Duration::from_millis(500)).unwrap();
        assert_eq!(a.register_app(APP_BOUNCE_ID), Err(NetError::AlreadyRegistered));
        a.shutdown();
    }

    #[test]
    fn test_injection_validations() {
        set_log_level(LogLevel::Off);
        let radio = Arc::new(RecordingRadio::new(MAC_A));
        let a = NetStack::new(0x16, true, fast_config(), radio).unwrap();
        let bounce = Bounce::init(&a, Duration::from_secs(1)).unwrap();

        let long = "x".repeat(BOUNCE_TEXT_MAX);
        assert_eq!(bounce.send_down(&long, 1), Err(NetError::InvalidArgument));
        assert_eq!(bounce.send_down("ok", 0), Err(NetError::InvalidArgument));
        assert_eq!(bounce.send_down("ok", 3), Ok(()));
        a.shutdown();
    }

    #[test]
    fn test_tick_re_emits_in_arrival_direction() {
        set_log_level(LogLevel::Off);
        let radio = Arc::new(RecordingRadio::new(MAC_A));
        let a = root_with_child(&radio);
        let bounce = Bounce::init(&a, Duration::from_secs(5)).unwrap();

        // A bounce packet arrives from the downstream child.
        let pkt = BouncePacket {
            counter: 0,
            life: 3,
            node_id: 0x17,
            text: "hi".into(),
        };
        let payload = pkt.encode();
        let head = AppHeader::new(APP_BOUNCE_ID, payload.len() as u8);
        let frame = NetFrame::data_frame(0x17, 0x16, &head, &payload);
        a.handle_frame(&MAC_B, &frame.encode());

        bounce.tick();
        assert!(wait_until(
            || bounce_frames(&radio).len() == 1,
            Duration::from_secs(2)
        ));
        let out = bounce_frames(&radio).remove(0);
        assert_eq!(out.counter, 1);
        assert_eq!(out.node_id, 0x16, "re-emitter stamps its own id");
        assert_eq!(out.text, "hi");

        a.shutdown();
    }

    #[test]
    fn test_ping_pong_over_hub() {
        set_log_level(LogLevel::Off);
        let hub = treelink_net::sim::SimHub::start();
        let radio_a = Arc::new(hub.endpoint(MAC_A));
        let radio_b = Arc::new(hub.endpoint(MAC_B));

        let a = NetStack::new(0x16, true, fast_config(), radio_a).unwrap();
        let b = NetStack::new(0x17, false, fast_config(), radio_b).unwrap();
        assert!(wait_until(
            || b.upstream_id() == Some(0x16),
            Duration::from_secs(5)
        ));

        let _bounce_a = Bounce::init(&a, BOUNCE_MIN_CYCLE).unwrap();
        let bounce_b = Bounce::init(&b, BOUNCE_MIN_CYCLE).unwrap();

        // Tap the medium and watch the counters of bounce frames.
        let counters = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&counters);
        hub.add_tap(Box::new(move |_, _, bytes| {
            if let Ok(f) = NetFrame::parse(bytes) {
                if f.control == ControlCode::Default
                    && f.app_header().app_id == APP_BOUNCE_ID
                {
                    if let Some(pkt) = BouncePacket::decode(f.app_payload()) {
                        sink.lock().unwrap().push(pkt.counter);
                    }
                }
            }
        }));

        // life = 2: the wire sees counters 0 (inject), 1 (bounced down by
        // A), 2 (bounced back up by B); A then drops it.
        bounce_b.send_up("hi", 2).unwrap();
        assert!(wait_until(
            || counters.lock().unwrap().len() >= 3,
            Duration::from_secs(5)
        ));
        // One more cycle: nothing further may appear.
        std::thread::sleep(BOUNCE_MIN_CYCLE + Duration::from_millis(300));
        assert_eq!(*counters.lock().unwrap(), vec![0, 1, 2]);

        a.shutdown();
        b.shutdown();
        hub.stop();
    }

    #[test]
    fn test_tick_drops_expired_packets() {
        set_log_level(LogLevel::Off);
        let radio = Arc::new(RecordingRadio::new(MAC_A));
        let a = root_with_child(&radio);
        let bounce = Bounce::init(&a, Duration::from_secs(5)).unwrap();

        // counter == life: the increment pushes it past the bound.
        let pkt = BouncePacket {
            counter: 3,
            life: 3,
            node_id: 0x17,
            text: "done".into(),
        };
        let payload = pkt.encode();
        let head = AppHeader::new(APP_BOUNCE_ID, payload.len() as u8);
        let frame = NetFrame::data_frame(0x17, 0x16, &head, &payload);
        a.handle_frame(&MAC_B, &frame.encode());

        bounce.tick();
        std::thread::sleep(Duration::from_millis(100));
        assert!(bounce_frames(&radio).is_empty());

        a.shutdown();
    }
}

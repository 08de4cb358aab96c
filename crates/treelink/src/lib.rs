//! # treelink
//!
//! A peer-to-peer broadcast-radio overlay for small nodes: tree-shaped
//! virtual linkage (one upstream parent, several downstream children) over
//! an unreliable fixed-size-datagram link, with typed application traffic
//! on top.
//!
//! This facade re-exports the public surface of the workspace crates:
//!
//! - [`treelink_core`] - frame codec, addressing, queues, big integers
//! - [`treelink_net`] - the node runtime ([`NetStack`]), timers, radios
//! - [`treelink_apps`] - hosted applications (Bounce, Collatz)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use treelink::{NetConfig, NetStack, SimHub, Mac};
//!
//! let hub = SimHub::start();
//! let radio = Arc::new(hub.endpoint(Mac([0xAA, 0, 0, 0, 0, 1])));
//! let root = NetStack::new(0x16, true, NetConfig::default(), radio).unwrap();
//! for (slot, id, mac) in root.table() {
//!     println!("{} {:02X} {}", slot, id, mac);
//! }
//! ```

pub use treelink_core::{
    AppHeader, BigInt, ControlCode, Direction, Mac, NetError, NetFrame, NetResult, NodeId,
    FRAME_LEN, MAX_PAYLOAD, NODE_BROADCAST,
};

pub use treelink_net::{
    Inbound, LinkTable, NetConfig, NetStack, Radio, RecordingRadio, SimHub, SimRadio,
    LINK_TABLE_SIZE, LINK_UP,
};

pub use treelink_apps::{
    BlockState, Bounce, BouncePacket, Collatz, CollatzConfig, APP_BOUNCE_ID, APP_COLLATZ_ID,
};

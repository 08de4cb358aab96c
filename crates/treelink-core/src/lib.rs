//! # treelink-core
//!
//! Core types for the treelink mesh overlay. This crate is platform- and
//! runtime-agnostic: the frame codec, addressing, bounded queues and the
//! Collatz big integer live here; threads, timers and the radio live in
//! `treelink-net`.
//!
//! ## Modules
//!
//! - `id` - node ids and physical (MAC) addresses
//! - `frame` - the fixed-size on-air frame codec and checksum
//! - `queue` - bounded drop-on-full queue with timeout-aware receive
//! - `bigint` - fixed-width base-2^30 integers for the Collatz verifier
//! - `error` - the network error taxonomy
//! - `logging` - leveled stderr log macros
//! - `env` - environment variable helpers

pub mod bigint;
pub mod env;
pub mod error;
pub mod frame;
pub mod id;
pub mod logging;
pub mod queue;

// Re-exports for convenience
pub use bigint::{BigInt, Overflow, INT_LEN, LIMB_BITS, LIMB_MASK};
pub use error::{NetError, NetResult};
pub use frame::{
    AppHeader, ControlCode, Direction, FrameError, NetFrame, Wire, APP_HEADER_LEN, CONTENTS_LEN,
    FRAME_LEN, HEADER_LEN, MAX_PAYLOAD,
};
pub use id::{Mac, NodeId, NODE_BROADCAST};
pub use queue::{bounded, QueueFull, Receiver, RecvTimeout, Sender};

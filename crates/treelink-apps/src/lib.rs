//! # treelink-apps
//!
//! Applications hosted on the treelink mesh overlay.
//!
//! - `bounce` - a hop-counting echo that ping-pongs messages along a
//!   branch of the tree
//! - `collatz` - cooperative, work-stealing verification of the Collatz
//!   conjecture over a shared advancing integer frame

pub mod bounce;
pub mod collatz;

// Re-exports for convenience
pub use bounce::{Bounce, BouncePacket, APP_BOUNCE_ID, BOUNCE_MIN_CYCLE, BOUNCE_TEXT_MAX};
pub use collatz::{BlockState, Collatz, CollatzConfig, Report, APP_COLLATZ_ID, REPORT_LEN};

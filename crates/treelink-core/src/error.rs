//! Error types for the network layer and its applications.

use core::fmt;

/// Result type for network-layer operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors returned by the public network API.
///
/// Every variant maps to a distinct non-zero numeric code via [`NetError::code`]
/// so callers bridging to status-code interfaces can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// The node has no upstream link.
    NoUplink,

    /// Payload exceeds the per-frame maximum.
    PayloadTooLarge,

    /// No inbound queue registered for the application id.
    AppNotRegistered,

    /// Inbound queue wait timed out.
    Timeout,

    /// A bounded queue was full and the item was dropped.
    QueueFull,

    /// The application id already has a registered queue.
    AlreadyRegistered,

    /// No free slot in a fixed-size table.
    TableFull,

    /// The link slot is already occupied.
    LinkExists,

    /// An argument failed validation (zero id, zero life, short cycle).
    InvalidArgument,

    /// Operation reserved for a future version.
    Unsupported,

    /// The radio rejected a transmission.
    RadioFailure,

    /// The node has blacked out and no longer services requests.
    Halted,
}

impl NetError {
    /// Distinct non-zero status code for each error.
    pub fn code(&self) -> i32 {
        match self {
            NetError::NoUplink => -1,
            NetError::PayloadTooLarge => -2,
            NetError::AppNotRegistered => -3,
            NetError::Timeout => -4,
            NetError::QueueFull => -5,
            NetError::AlreadyRegistered => -6,
            NetError::TableFull => -7,
            NetError::LinkExists => -8,
            NetError::InvalidArgument => -9,
            NetError::Unsupported => -10,
            NetError::RadioFailure => -11,
            NetError::Halted => -12,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::NoUplink => write!(f, "no up-stream link"),
            NetError::PayloadTooLarge => write!(f, "payload too large"),
            NetError::AppNotRegistered => write!(f, "application not registered"),
            NetError::Timeout => write!(f, "queue wait timed out"),
            NetError::QueueFull => write!(f, "queue full"),
            NetError::AlreadyRegistered => write!(f, "application already registered"),
            NetError::TableFull => write!(f, "table full"),
            NetError::LinkExists => write!(f, "link already established"),
            NetError::InvalidArgument => write!(f, "invalid argument"),
            NetError::Unsupported => write!(f, "operation not supported"),
            NetError::RadioFailure => write!(f, "radio send failure"),
            NetError::Halted => write!(f, "node halted"),
        }
    }
}

impl std::error::Error for NetError {}

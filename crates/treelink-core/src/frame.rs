//! On-air frame layout and codec.
//!
//! Every transmission is exactly [`FRAME_LEN`] bytes: a 16-byte network
//! header followed by 136 bytes of contents. Data frames (control code
//! `Default`) carry an 8-byte application header plus up to 128 payload
//! bytes inside the contents region.
//!
//! ```text
//! offset 0        version+type (constant 0x11)
//! offset 1        source node id
//! offset 2        destination node id
//! offset 3        XOR checksum over the other 151 bytes
//! offset 4        control code
//! offset 5..15    reserved[11]   (reserved[0] = locate ident / map origin,
//!                                 reserved[1] = map upstream id)
//! offset 16..151  contents
//! ```
//!
//! Frames are never reinterpreted in place; [`NetFrame::encode`] and
//! [`NetFrame::parse`] copy through an explicit, validating codec.

use core::fmt;

use crate::id::NodeId;

/// Total on-air frame size in bytes.
pub const FRAME_LEN: usize = 152;

/// Network header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Contents region size in bytes.
pub const CONTENTS_LEN: usize = FRAME_LEN - HEADER_LEN;

/// Application header size in bytes (start of the contents region).
pub const APP_HEADER_LEN: usize = 8;

/// Maximum application payload size in bytes.
pub const MAX_PAYLOAD: usize = CONTENTS_LEN - APP_HEADER_LEN;

/// Network type nibble of the version byte.
pub const NET_TYPE: u8 = 0x10;

/// Network version nibble of the version byte.
pub const NET_VERSION: u8 = 0x01;

/// The constant version byte every valid frame carries.
pub const VERSION_BYTE: u8 = NET_TYPE | NET_VERSION;

/// Reserved-byte index of the Locate/Link identifier (and map origin).
pub const RES_IDENT: usize = 0;

/// Reserved-byte index of the map origin id.
pub const RES_ORIGIN: usize = 0;

/// Reserved-byte index of the map upstream id.
pub const RES_UPSTREAM: usize = 1;

const OFFSET_CHECKSUM: usize = 3;
const RESERVED_LEN: usize = 11;

/// Encoded frame bytes, ready for the radio.
pub type Wire = [u8; FRAME_LEN];

/// Control code carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    /// Application data, dispatched to the inbound queue of its app id.
    Default = 0,
    /// Broadcast probe from an unlinked node looking for a parent.
    Locate = 1,
    /// Link proposal (responding to Locate) or confirmation (accepting one).
    Link = 2,
    /// Liveness probe / response between linked peers.
    Status = 3,
    /// Topology sweep: answered upstream, forwarded downstream.
    Map = 4,
    /// Subtree restart order.
    Blackout = 5,
    /// Network-wide quiescence toggle.
    Freeze = 6,
}

impl ControlCode {
    /// Decode a control byte; unknown codes are invalid frames.
    pub fn from_u8(v: u8) -> Option<ControlCode> {
        match v {
            0 => Some(ControlCode::Default),
            1 => Some(ControlCode::Locate),
            2 => Some(ControlCode::Link),
            3 => Some(ControlCode::Status),
            4 => Some(ControlCode::Map),
            5 => Some(ControlCode::Blackout),
            6 => Some(ControlCode::Freeze),
            _ => None,
        }
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlCode::Default => "DEFAULT",
            ControlCode::Locate => "LOCATE",
            ControlCode::Link => "LINK",
            ControlCode::Status => "STATUS",
            ControlCode::Map => "MAP",
            ControlCode::Blackout => "BLACKOUT",
            ControlCode::Freeze => "FREEZE",
        };
        write!(f, "{}", name)
    }
}

/// Why a byte buffer failed to parse as a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer length is not [`FRAME_LEN`].
    Length,
    /// Version byte mismatch.
    Version,
    /// Stored checksum does not match the recomputed one.
    Checksum,
    /// Unknown control code.
    Control,
}

/// Decoded on-air frame.
///
/// The version byte and checksum are not stored; `encode` stamps both.
#[derive(Clone)]
pub struct NetFrame {
    pub source: NodeId,
    pub destination: NodeId,
    pub control: ControlCode,
    pub reserved: [u8; RESERVED_LEN],
    pub contents: [u8; CONTENTS_LEN],
}

impl fmt::Debug for NetFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetFrame")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

impl NetFrame {
    /// A frame with empty contents, the shape of all control traffic.
    pub fn control_frame(source: NodeId, destination: NodeId, control: ControlCode) -> NetFrame {
        NetFrame {
            source,
            destination,
            control,
            reserved: [0; RESERVED_LEN],
            contents: [0; CONTENTS_LEN],
        }
    }

    /// A data frame carrying an application header and payload.
    ///
    /// `payload.len()` must not exceed [`MAX_PAYLOAD`]; the caller validates
    /// before getting here.
    pub fn data_frame(
        source: NodeId,
        destination: NodeId,
        head: &AppHeader,
        payload: &[u8],
    ) -> NetFrame {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        let mut frame = NetFrame::control_frame(source, destination, ControlCode::Default);
        frame.contents[..APP_HEADER_LEN].copy_from_slice(&head.encode());
        frame.contents[APP_HEADER_LEN..APP_HEADER_LEN + payload.len()].copy_from_slice(payload);
        frame
    }

    /// Serialize, stamping the version byte and checksum.
    pub fn encode(&self) -> Wire {
        let mut out = [0u8; FRAME_LEN];
        out[0] = VERSION_BYTE;
        out[1] = self.source;
        out[2] = self.destination;
        out[4] = self.control as u8;
        out[5..HEADER_LEN].copy_from_slice(&self.reserved);
        out[HEADER_LEN..].copy_from_slice(&self.contents);
        out[OFFSET_CHECKSUM] = checksum(&out);
        out
    }

    /// Validate and decode a received buffer.
    ///
    /// Rejects wrong lengths, wrong versions, checksum mismatches and
    /// unknown control codes. Rejected frames are dropped silently by the
    /// receiver.
    pub fn parse(bytes: &[u8]) -> Result<NetFrame, FrameError> {
        if bytes.len() != FRAME_LEN {
            return Err(FrameError::Length);
        }
        let mut wire = [0u8; FRAME_LEN];
        wire.copy_from_slice(bytes);

        if wire[0] != VERSION_BYTE {
            return Err(FrameError::Version);
        }
        if wire[OFFSET_CHECKSUM] != checksum(&wire) {
            return Err(FrameError::Checksum);
        }
        let control = ControlCode::from_u8(wire[4]).ok_or(FrameError::Control)?;

        let mut reserved = [0u8; RESERVED_LEN];
        reserved.copy_from_slice(&wire[5..HEADER_LEN]);
        let mut contents = [0u8; CONTENTS_LEN];
        contents.copy_from_slice(&wire[HEADER_LEN..]);

        Ok(NetFrame {
            source: wire[1],
            destination: wire[2],
            control,
            reserved,
            contents,
        })
    }

    /// The application header of a `Default` frame's contents.
    pub fn app_header(&self) -> AppHeader {
        AppHeader::decode(&self.contents[..APP_HEADER_LEN])
    }

    /// The payload slice of a `Default` frame, clamped to the header length.
    pub fn app_payload(&self) -> &[u8] {
        let len = (self.app_header().len as usize).min(MAX_PAYLOAD);
        &self.contents[APP_HEADER_LEN..APP_HEADER_LEN + len]
    }
}

/// XOR of every frame byte except the checksum byte itself.
pub fn checksum(wire: &Wire) -> u8 {
    let mut balance = 0u8;
    for (i, b) in wire.iter().enumerate() {
        if i != OFFSET_CHECKSUM {
            balance ^= b;
        }
    }
    balance
}

/// Quick validity predicate over raw received bytes.
pub fn valid_packet(bytes: &[u8]) -> bool {
    NetFrame::parse(bytes).is_ok()
}

/// Application header at the front of a data frame's contents.
///
/// ```text
/// offset 0..1   application id (u16 little-endian, non-zero)
/// offset 2      payload length (0..=128)
/// offset 3..7   reserved, zero on the wire
/// ```
///
/// Arrival direction is *not* part of the wire header; the receive API
/// reports it as an explicit field instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppHeader {
    pub app_id: u16,
    pub len: u8,
}

impl AppHeader {
    pub fn new(app_id: u16, len: u8) -> AppHeader {
        AppHeader { app_id, len }
    }

    pub fn encode(&self) -> [u8; APP_HEADER_LEN] {
        let mut out = [0u8; APP_HEADER_LEN];
        out[..2].copy_from_slice(&self.app_id.to_le_bytes());
        out[2] = self.len;
        out
    }

    /// Decode from the first [`APP_HEADER_LEN`] bytes of a contents region.
    pub fn decode(bytes: &[u8]) -> AppHeader {
        debug_assert!(bytes.len() >= APP_HEADER_LEN);
        AppHeader {
            app_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            len: bytes[2],
        }
    }
}

/// Which side of the tree a frame arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromUpstream,
    FromDownstream,
}

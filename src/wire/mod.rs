//! Wire protocol for the message bus
//!
//! Frames are length-prefixed: a 4-byte total length, a 2-byte routing
//! length, the routing header (a CBOR map), and an optional opaque
//! payload. The broker parses the routing header for the recognized
//! keys and treats everything else as bytes to forward untouched.

pub mod frame;
pub mod header;

pub use frame::{read_frame, write_frame, Frame, MAX_FRAME_SIZE};
pub use header::{decode_payload_map, encode_payload_map, RoutingHeader};

use thiserror::Error;

/// Error type for frame encoding and decoding
#[derive(Debug, Error)]
pub enum FrameError {
    /// Total length does not even cover the routing length field
    #[error("frame length {0} is shorter than the routing length field")]
    TooShort(u32),

    /// Zero-length routing header
    #[error("routing header is empty")]
    EmptyRouting,

    /// Routing length points past the end of the frame
    #[error("routing length {routing} overruns the frame ({available} bytes available)")]
    RoutingOverrun {
        /// Claimed routing header length
        routing: u16,
        /// Bytes actually available after the routing length field
        available: usize,
    },

    /// Frame exceeds the configured maximum
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Claimed frame size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Routing header too large for the 2-byte length field
    #[error("routing header of {0} bytes exceeds the u16 length field")]
    RoutingTooLong(usize),

    /// The peer closed the connection in the middle of a frame
    #[error("connection closed mid-frame")]
    Truncated,

    /// The routing header is not a string-keyed CBOR map
    #[error("routing header is not a string-keyed map")]
    HeaderNotMap,

    /// The routing header bytes failed to parse or serialize
    #[error("bad routing header: {0}")]
    HeaderEncoding(#[from] serde_cbor::Error),

    /// I/O failure while reading or writing a frame
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

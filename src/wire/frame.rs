//! Length-framed message encoding and decoding
//!
//! Wire layout:
//!
//! ```text
//! +------------------+---------------------+-----------------+-------------+
//! | total_len (u32)  | routing_len (u16)   | routing bytes   | payload     |
//! +------------------+---------------------+-----------------+-------------+
//! ```
//!
//! Both length fields are big-endian. `total_len` counts the routing
//! length field, the routing bytes, and the payload. Length fields are
//! validated before any allocation happens.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::FrameError;

/// Hard upper bound on a single frame
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length of the total-length prefix
const TOTAL_LEN_BYTES: usize = 4;

/// Length of the routing-length field
const ROUTING_LEN_BYTES: usize = 2;

/// A decoded wire frame: routing header bytes plus opaque payload
///
/// Cheap to clone; both halves are reference-counted `Bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Serialized routing header (CBOR map)
    pub routing: Bytes,
    /// Opaque payload, possibly empty
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from routing bytes and a payload
    pub fn new(routing: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            routing: routing.into(),
            payload: payload.into(),
        }
    }

    /// Encode to the full wire representation, length prefixes included
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.routing.is_empty() {
            return Err(FrameError::EmptyRouting);
        }
        if self.routing.len() > u16::MAX as usize {
            return Err(FrameError::RoutingTooLong(self.routing.len()));
        }
        let total = ROUTING_LEN_BYTES + self.routing.len() + self.payload.len();
        if total > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(TOTAL_LEN_BYTES + total);
        buf.put_u32(total as u32);
        buf.put_u16(self.routing.len() as u16);
        buf.extend_from_slice(&self.routing);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode from the full wire representation
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < TOTAL_LEN_BYTES {
            return Err(FrameError::Truncated);
        }
        let total = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if total < ROUTING_LEN_BYTES as u32 {
            return Err(FrameError::TooShort(total));
        }
        let body = &bytes[TOTAL_LEN_BYTES..];
        if body.len() < total as usize {
            return Err(FrameError::Truncated);
        }
        Self::from_body(Bytes::copy_from_slice(&body[..total as usize]))
    }

    /// Split a frame body (everything after the total length) into
    /// routing and payload
    pub(crate) fn from_body(body: Bytes) -> Result<Self, FrameError> {
        let routing_len = u16::from_be_bytes([body[0], body[1]]);
        if routing_len == 0 {
            return Err(FrameError::EmptyRouting);
        }
        let available = body.len() - ROUTING_LEN_BYTES;
        if routing_len as usize > available {
            return Err(FrameError::RoutingOverrun {
                routing: routing_len,
                available,
            });
        }
        let routing_end = ROUTING_LEN_BYTES + routing_len as usize;
        Ok(Self {
            routing: body.slice(ROUTING_LEN_BYTES..routing_end),
            payload: body.slice(routing_end..),
        })
    }
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly, that
/// is before sending any byte of a new frame. EOF after the first byte
/// of a frame is [`FrameError::Truncated`]. The total length is
/// validated against `max_frame` before the body is allocated.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; TOTAL_LEN_BYTES];
    if !read_exact_or_eof(reader, &mut len_buf).await? {
        return Ok(None);
    }
    let total = u32::from_be_bytes(len_buf);
    if total < ROUTING_LEN_BYTES as u32 {
        return Err(FrameError::TooShort(total));
    }
    if total as usize > max_frame {
        return Err(FrameError::TooLarge {
            size: total as usize,
            max: max_frame,
        });
    }

    let mut body = vec![0u8; total as usize];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;

    Frame::from_body(Bytes::from(body)).map(Some)
}

/// Write one frame to the stream
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await.map_err(FrameError::Io)?;
    Ok(())
}

/// Fill `buf` exactly, or report a clean EOF.
///
/// Returns `Ok(false)` if the stream ended before the first byte;
/// `UnexpectedEof` if it ended after a partial fill.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(FrameError::Io)?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(FrameError::Truncated);
        }
        filled += n;
    }
    Ok(true)
}

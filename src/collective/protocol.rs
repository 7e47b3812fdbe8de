//! Wire protocol for the TCP group transport.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8).
//! Frame format: len:u32 | type:u8 | payload
//!
//! Payload frames are never buffered: the header is written, then the
//! caller's chunk buffer, and the receiver reads the body straight into its
//! own chunk buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version spoken by this build
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum size of any non-payload frame (64KB)
pub const MAX_CONTROL_FRAME_SIZE: u32 = 64 * 1024;

/// Longest abort reason carried on the wire
const MAX_REASON_LEN: usize = 1024;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    ChunkSize = 0x02,
    Payload = 0x03,
    Timing = 0x04,
    Release = 0x05,
    Abort = 0x06,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::ChunkSize),
            0x03 => Some(Self::Payload),
            0x04 => Some(Self::Timing),
            0x05 => Some(Self::Release),
            0x06 => Some(Self::Abort),
            _ => None,
        }
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn frame(msg_type: MessageType, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    buf
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

/// Sent by a peer when it joins, answered by the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub rank: u32,
    pub size: u32,
}

impl Hello {
    pub fn new(rank: u32, size: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            rank,
            size,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::Hello, 10);
        buf.put_u16(self.version);
        buf.put_u32(self.rank);
        buf.put_u32(self.size);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> io::Result<Self> {
        if payload.remaining() < 10 {
            return Err(invalid("Hello payload too short"));
        }
        Ok(Self {
            version: payload.get_u16(),
            rank: payload.get_u32(),
            size: payload.get_u32(),
        })
    }
}

// =============================================================================
// CHUNK_SIZE (0x02)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSize {
    pub size: u64,
}

impl ChunkSize {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::ChunkSize, 8);
        buf.put_u64(self.size);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> io::Result<Self> {
        if payload.remaining() < 8 {
            return Err(invalid("ChunkSize payload too short"));
        }
        Ok(Self {
            size: payload.get_u64(),
        })
    }
}

// =============================================================================
// PAYLOAD (0x03)
// =============================================================================

/// Header of a payload frame carrying `len` bytes.
pub fn payload_header(len: u32) -> [u8; 5] {
    let mut header = [0u8; 5];
    header[..4].copy_from_slice(&len.to_be_bytes());
    header[4] = MessageType::Payload as u8;
    header
}

// =============================================================================
// TIMING (0x04) / RELEASE (0x05)
// =============================================================================

/// A peer's elapsed wall time, sent to the origin for the max reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub elapsed_secs: f64,
}

impl Timing {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::Timing, 8);
        buf.put_f64(self.elapsed_secs);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> io::Result<Self> {
        if payload.remaining() < 8 {
            return Err(invalid("Timing payload too short"));
        }
        Ok(Self {
            elapsed_secs: payload.get_f64(),
        })
    }
}

/// Origin's answer once every sample is in; peers block on it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Release {
    pub max_elapsed_secs: f64,
}

impl Release {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::Release, 8);
        buf.put_f64(self.max_elapsed_secs);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> io::Result<Self> {
        if payload.remaining() < 8 {
            return Err(invalid("Release payload too short"));
        }
        Ok(Self {
            max_elapsed_secs: payload.get_f64(),
        })
    }
}

// =============================================================================
// ABORT (0x06)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub rank: u32,
    pub reason: String,
}

impl Abort {
    pub fn encode(&self) -> Bytes {
        let mut end = self.reason.len().min(MAX_REASON_LEN);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }
        let reason = &self.reason.as_bytes()[..end];

        let mut buf = frame(MessageType::Abort, 4 + 2 + reason.len());
        buf.put_u32(self.rank);
        buf.put_u16(reason.len() as u16);
        buf.put_slice(reason);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> io::Result<Self> {
        if payload.remaining() < 6 {
            return Err(invalid("Abort payload too short"));
        }
        let rank = payload.get_u32();
        let reason_len = payload.get_u16() as usize;
        if payload.remaining() < reason_len {
            return Err(invalid(format!(
                "Abort reason truncated: expected {} bytes, got {}",
                reason_len,
                payload.remaining()
            )));
        }
        let reason = String::from_utf8_lossy(&payload.copy_to_bytes(reason_len)).into_owned();
        Ok(Self { rank, reason })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a frame header. Returns (message_type, payload_len).
pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<(MessageType, u32)> {
    let len = r.read_u32().await?;
    let msg_type = r.read_u8().await?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| invalid(format!("Unknown message type 0x{:02x}", msg_type)))?;
    Ok((msg_type, len))
}

/// Read the body of a control frame whose header was already consumed.
pub async fn read_body<R: AsyncRead + Unpin>(r: &mut R, len: u32) -> io::Result<Bytes> {
    // Validate frame size before allocation
    if len > MAX_CONTROL_FRAME_SIZE {
        return Err(invalid(format!(
            "Frame size {} exceeds maximum control frame size {}",
            len, MAX_CONTROL_FRAME_SIZE
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Read a single control frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<(MessageType, Bytes)> {
    let (msg_type, len) = read_header(r).await?;
    if msg_type == MessageType::Payload {
        return Err(invalid("Payload frame where a control frame was expected"));
    }
    let payload = read_body(r, len).await?;
    Ok((msg_type, payload))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> io::Result<()> {
    w.write_all(frame).await?;
    w.flush().await
}

// =============================================================================
// Tests
// =============================================================================

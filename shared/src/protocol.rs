//! Binary frame protocol spoken with the broker over a reverse connection.
//!
//! Wire format:
//! ```text
//! +0   Channel (2 bytes BE16, bit 15 = command flag, bits 0-14 = channel id)
//! +2   Payload Length (4 bytes BE32)
//! +6   Payload (variable, at most MAX_PAYLOAD_LEN bytes)
//! ```

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, timeout_at, Instant};

use crate::{Error, Result};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 6;

/// Maximum payload carried by a single frame (u16::MAX - HEADER_LEN)
pub const MAX_PAYLOAD_LEN: usize = 65529;

/// Bit marking a frame as a command frame
pub const COMMAND_FLAG: u16 = 0x8000;

/// Bits holding the channel id
pub const CHANNEL_MASK: u16 = 0x7FFF;

/// Broker asks the agent to relay the HTTP request in the next frame
pub const CMD_CONNECT: &str = "CONNECT";

/// Broker asks the agent to drop and re-establish the connection
pub const CMD_RESET: &str = "RESET";

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel_id: u16,
    pub is_command: bool,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut channel = self.channel_id & CHANNEL_MASK;
        if self.is_command {
            channel |= COMMAND_FLAG;
        }
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&channel.to_be_bytes());
        out[2..6].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        let channel = u16::from_be_bytes([buf[0], buf[1]]);
        Self {
            channel_id: channel & CHANNEL_MASK,
            is_command: channel & COMMAND_FLAG != 0,
            payload_len: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        }
    }
}

/// A complete frame read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Command name (e.g. CONNECT, RESET)
    Command { channel_id: u16, payload: Vec<u8> },
    /// Request or response bytes
    Data { channel_id: u16, payload: Vec<u8> },
}

impl Frame {
    pub fn channel_id(&self) -> u16 {
        match self {
            Frame::Command { channel_id, .. } | Frame::Data { channel_id, .. } => *channel_id,
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Frame::Command { .. })
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Command { payload, .. } | Frame::Data { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Frame::Command { payload, .. } | Frame::Data { payload, .. } => payload,
        }
    }
}

/// Encode a frame. Channel ids are clamped to 15 bits.
pub fn encode_frame(channel_id: u16, is_command: bool, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        channel_id,
        is_command,
        payload_len: payload.len() as u32,
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Read and decode exactly one frame header.
pub async fn decode_header<R>(reader: &mut R) -> Result<FrameHeader>
where
    R: AsyncRead + Unpin,
{
    read_header(reader, None).await
}

/// Header read with an optional deadline.
///
/// Expiry before the first byte is an idle [`Error::Timeout`]; expiry after
/// it is [`Error::PartialTimeout`].
async fn read_header<R>(reader: &mut R, deadline: Option<Instant>) -> Result<FrameHeader>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let read = reader.read(&mut buf[filled..]);
        let n = match deadline {
            Some(deadline) => match timeout_at(deadline, read).await {
                Ok(n) => n?,
                Err(_) if filled == 0 => return Err(Error::Timeout),
                Err(_) => return Err(Error::PartialTimeout { read: filled }),
            },
            None => read.await?,
        };
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }
    Ok(FrameHeader::from_bytes(&buf))
}

/// Read exactly `len` payload bytes.
///
/// EOF before `len` bytes yields [`Error::ShortRead`] carrying whatever was read.
pub async fn decode_payload<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            buf.truncate(filled);
            return Err(Error::ShortRead {
                expected: len,
                actual: filled,
                partial: buf,
            });
        }
        filled += n;
    }
    Ok(buf)
}

/// Read one frame, bounding each of the header and payload reads by
/// `comm_timeout` when given.
///
/// Only a timeout before any byte of the frame arrived is reported as
/// [`Error::Timeout`]; one that cuts a frame short leaves the stream
/// misaligned and is reported as [`Error::PartialTimeout`]. Oversized frames
/// are rejected before any payload is read.
pub async fn read_frame<R>(reader: &mut R, comm_timeout: Option<Duration>) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader, comm_timeout.map(|limit| Instant::now() + limit)).await?;

    let len = header.payload_len as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(Error::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let payload = match comm_timeout {
        Some(limit) => timeout(limit, decode_payload(reader, len))
            .await
            .map_err(|_| Error::PartialTimeout { read: HEADER_LEN })??,
        None => decode_payload(reader, len).await?,
    };

    let channel_id = header.channel_id;
    Ok(if header.is_command {
        Frame::Command { channel_id, payload }
    } else {
        Frame::Data { channel_id, payload }
    })
}

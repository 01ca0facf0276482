// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Frame codec (C1).
//!
//! Every message exchanged over a control channel is a length-prefixed
//! frame with a fixed 9-byte big-endian header:
//!
//! ```text
//! offset  size  field
//!  0      4     length  (u32, total frame incl. header)
//!  4      4     uid     (u32; 0 reserved for control frames)
//!  8      1     type    (u8)
//!  9      …     payload (length - 9 bytes)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U32};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 9;

/// No frame may declare a length above this; above it the channel is torn
/// down rather than risking an unbounded payload allocation.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Wire-exact, zero-copy view of the 9-byte frame header.
#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHeader {
    length: U32<BigEndian>,
    uid: U32<BigEndian>,
    msg_type: u8,
}

/// The closed set of control-channel message types, plus a catch-all for
/// anything this build doesn't recognize (see §9 "Dynamic dispatch on
/// msg_type" — unknown types are logged and ignored, never fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Data,
    NewClient,
    Disconnect,
    Ping,
    Pong,
    NewConnectionEstablished,
    EndOfConnection,
    Unknown(u8),
}

impl MessageType {
    fn from_u8(v: u8) -> Self {
        match v {
            0x01 => Self::Data,
            0x02 => Self::NewClient,
            0x03 => Self::Disconnect,
            0x04 => Self::Ping,
            0x05 => Self::Pong,
            0x06 => Self::NewConnectionEstablished,
            0x07 => Self::EndOfConnection,
            other => Self::Unknown(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Data => 0x01,
            Self::NewClient => 0x02,
            Self::Disconnect => 0x03,
            Self::Ping => 0x04,
            Self::Pong => 0x05,
            Self::NewConnectionEstablished => 0x06,
            Self::EndOfConnection => 0x07,
            Self::Unknown(v) => v,
        }
    }
}

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub uid: u32,
    pub msg_type: MessageType,
    pub payload: Bytes,
}

/// Failures that can occur while decoding a frame off the wire. Only these
/// are fatal to a control channel — an unrecognized `msg_type` is not one
/// of them (it decodes fine, into `MessageType::Unknown`).
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length {0} is below the {HEADER_LEN} byte header")]
    TooShort(u32),
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN} byte ceiling")]
    TooLarge(u32),
    #[error("connection closed mid-frame")]
    TruncatedFrame,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Builds the wire bytes for one frame. Pure; never fails.
pub fn encode(uid: u32, msg_type: MessageType, payload: &[u8]) -> Bytes {
    let length = (HEADER_LEN + payload.len()) as u32;
    let mut buf = BytesMut::with_capacity(length as usize);
    buf.put_u32(length);
    buf.put_u32(uid);
    buf.put_u8(msg_type.to_u8());
    buf.put_slice(payload);
    buf.freeze()
}

/// Reads exactly one frame off `reader`.
///
/// A clean end-of-stream before any header byte is arrives returns `Ok(None)`
/// — the sentinel "closed" state. End-of-stream in the middle of a header
/// or payload is `Err(FrameError::TruncatedFrame)`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, FrameError> {
    let mut hdr_buf = [0u8; HEADER_LEN];
    if !fill_or_eof(reader, &mut hdr_buf).await? {
        return Ok(None);
    }

    let hdr = RawHeader::ref_from_bytes(&hdr_buf)
        .unwrap_or_else(|_| unreachable!("hdr_buf is exactly HEADER_LEN bytes"));
    let length = hdr.length.get();
    if length < HEADER_LEN as u32 {
        return Err(FrameError::TooShort(length));
    }
    if length > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(length));
    }

    let payload_len = (length as usize) - HEADER_LEN;
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::TruncatedFrame
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok(Some(Frame {
        uid: hdr.uid.get(),
        msg_type: MessageType::from_u8(hdr.msg_type),
        payload: Bytes::from(payload),
    }))
}

/// Fills `buf` completely, or returns `Ok(false)` if the stream closed
/// before any byte was read. Closing mid-buffer is `TruncatedFrame`.
async fn fill_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<bool, FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(FrameError::TruncatedFrame);
        }
        filled += n;
    }
    Ok(true)
}

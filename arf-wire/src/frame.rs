//! Binary frame format.
//!
//! Frame layout (11 byte header + payload):
//!
//! ```text
//! +--------+-----------+------+-------+--------+------------+
//! | magic  | stream_id | kind | flags | length | payload    |
//! | 3 bytes|  4 bytes  |1 byte|1 byte | 2 bytes| len bytes  |
//! +--------+-----------+------+-------+--------+------------+
//! ```
//!
//! `stream_id == 0` marks connection-level frames. Integers are big-endian.

use crate::compression::CompressionMethod;
use crate::error::{ErrorCode, WireError};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Magic bytes beginning every frame: "arf".
pub const MAGIC: [u8; 3] = *b"arf";

/// Size of the fixed frame header in bytes (3+4+1+1+2 = 11).
pub const FRAME_HEADER_SIZE: usize = 11;

/// Maximum payload carried by one frame; larger writes are chunked.
pub const MAX_PAYLOAD: usize = 65535;

/// Chunk size used when splitting writes into DATA frames. Kept below
/// [`MAX_PAYLOAD`] so an incompressible chunk still fits the frame length
/// after DEFLATE adds its stored-block overhead.
pub const MAX_DATA_CHUNK: usize = MAX_PAYLOAD - 64;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Hello = 0x00,
    Ping = 0x01,
    GoAway = 0x02,
    MakeStream = 0x03,
    ResetStream = 0x04,
    Data = 0x05,
}

impl FrameKind {
    pub fn from_byte(b: u8) -> Option<FrameKind> {
        match b {
            0x00 => Some(FrameKind::Hello),
            0x01 => Some(FrameKind::Ping),
            0x02 => Some(FrameKind::GoAway),
            0x03 => Some(FrameKind::MakeStream),
            0x04 => Some(FrameKind::ResetStream),
            0x05 => Some(FrameKind::Data),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Hello => "HELLO",
            FrameKind::Ping => "PING",
            FrameKind::GoAway => "GO_AWAY",
            FrameKind::MakeStream => "MAKE_STREAM",
            FrameKind::ResetStream => "RESET_STREAM",
            FrameKind::Data => "DATA",
        };
        f.write_str(name)
    }
}

/// A raw frame as read from or written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Encodes the frame, compressing the payload with `method` first.
    pub fn encode(&self, method: CompressionMethod) -> Result<BytesMut, WireError> {
        let payload = method.compress(&self.payload);
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::FrameTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags);
        buf.put_u16(payload.len() as u16);
        buf.put_slice(&payload);
        Ok(buf)
    }

    /// Decompresses the payload in place.
    pub fn decompress(&mut self, method: CompressionMethod) -> Result<(), WireError> {
        self.payload = method.decompress(&self.payload)?;
        Ok(())
    }

    fn validate_kind(&self, expected: FrameKind, associated: bool) -> Result<(), WireError> {
        if self.kind != expected {
            return Err(WireError::FrameKindMismatch {
                expected,
                received: self.kind,
            });
        }
        if associated && self.stream_id == 0 {
            return Err(WireError::UnassociatedFrame(self.kind));
        }
        if !associated && self.stream_id != 0 {
            return Err(WireError::AssociatedFrame(self.kind));
        }
        Ok(())
    }

    fn validate_size(&self, expected: usize) -> Result<(), WireError> {
        if self.payload.len() != expected {
            return Err(WireError::InvalidFrameLength(format!(
                "invalid length for frame {}: {} bytes are required, received {}",
                self.kind,
                expected,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

/// HELLO: handshake and compression negotiation.
///
/// Flags: bit 0 = ack, bit 1 = DEFLATE requested/accepted. The payload is
/// empty or a `u32` advertising `max_concurrent_streams` (reserved).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HelloFrame {
    pub ack: bool,
    pub deflate: bool,
    pub max_concurrent_streams: u32,
}

const HELLO_ACK: u8 = 0x01;
const HELLO_DEFLATE: u8 = 0x01 << 1;

impl HelloFrame {
    pub fn into_frame(self) -> Frame {
        let mut flags = 0u8;
        if self.ack {
            flags |= HELLO_ACK;
        }
        if self.deflate {
            flags |= HELLO_DEFLATE;
        }
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(self.max_concurrent_streams);
        Frame {
            stream_id: 0,
            kind: FrameKind::Hello,
            flags,
            payload: payload.freeze(),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<HelloFrame, WireError> {
        frame.validate_kind(FrameKind::Hello, false)?;

        let ack = frame.flags & HELLO_ACK != 0;
        let deflate = frame.flags & HELLO_DEFLATE != 0;

        let max_concurrent_streams = match frame.payload.len() {
            0 => 0,
            4 => u32::from_be_bytes(frame.payload[0..4].try_into().unwrap()),
            n => {
                return Err(WireError::InvalidFrameLength(format!(
                    "invalid length {} for frame HELLO, expected either 0 or 4 bytes",
                    n
                )))
            }
        };

        if max_concurrent_streams != 0 && !ack {
            return Err(WireError::InvalidFrame(
                "received non-ack HELLO with non-zero max_concurrent_streams".to_string(),
            ));
        }

        Ok(HelloFrame {
            ack,
            deflate,
            max_concurrent_streams,
        })
    }
}

/// PING: liveness probe with an 8-byte opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub payload: Bytes,
}

const PING_ACK: u8 = 0x01 << 2;

impl PingFrame {
    pub fn into_frame(self) -> Frame {
        Frame {
            stream_id: 0,
            kind: FrameKind::Ping,
            flags: if self.ack { PING_ACK } else { 0 },
            payload: self.payload,
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<PingFrame, WireError> {
        frame.validate_kind(FrameKind::Ping, false)?;
        frame.validate_size(8)?;
        Ok(PingFrame {
            ack: frame.flags & PING_ACK != 0,
            payload: frame.payload.clone(),
        })
    }
}

/// GO_AWAY: connection termination announcing the last serviced stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub additional_data: Bytes,
}

impl GoAwayFrame {
    pub fn into_frame(self) -> Frame {
        let mut payload = BytesMut::with_capacity(8 + self.additional_data.len());
        payload.put_u32(self.last_stream_id);
        payload.put_u32(self.error_code.code());
        payload.put_slice(&self.additional_data);
        Frame {
            stream_id: 0,
            kind: FrameKind::GoAway,
            flags: 0,
            payload: payload.freeze(),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<GoAwayFrame, WireError> {
        frame.validate_kind(FrameKind::GoAway, false)?;
        if frame.payload.len() < 8 {
            return Err(WireError::InvalidFrameLength(
                "invalid length for frame GO_AWAY: at least 8 bytes are required".to_string(),
            ));
        }
        Ok(GoAwayFrame {
            last_stream_id: u32::from_be_bytes(frame.payload[0..4].try_into().unwrap()),
            error_code: ErrorCode::from_u32(u32::from_be_bytes(
                frame.payload[4..8].try_into().unwrap(),
            )),
            additional_data: frame.payload.slice(8..),
        })
    }
}

/// MAKE_STREAM: opens a stream; always initiated by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MakeStreamFrame {
    pub stream_id: u32,
}

impl MakeStreamFrame {
    pub fn into_frame(self) -> Frame {
        Frame {
            stream_id: self.stream_id,
            kind: FrameKind::MakeStream,
            flags: 0,
            payload: Bytes::new(),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<MakeStreamFrame, WireError> {
        frame.validate_kind(FrameKind::MakeStream, true)?;
        frame.validate_size(0)?;
        Ok(MakeStreamFrame {
            stream_id: frame.stream_id,
        })
    }
}

/// RESET_STREAM: aborts one stream with an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

impl ResetStreamFrame {
    pub fn into_frame(self) -> Frame {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(self.error_code.code());
        Frame {
            stream_id: self.stream_id,
            kind: FrameKind::ResetStream,
            flags: 0,
            payload: payload.freeze(),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<ResetStreamFrame, WireError> {
        frame.validate_kind(FrameKind::ResetStream, true)?;
        frame.validate_size(4)?;
        Ok(ResetStreamFrame {
            stream_id: frame.stream_id,
            error_code: ErrorCode::from_u32(u32::from_be_bytes(
                frame.payload[0..4].try_into().unwrap(),
            )),
        })
    }
}

const DATA_END_STREAM: u8 = 0x01;
const DATA_END_DATA: u8 = 0x01 << 1;

/// DATA: one fragment of a stream's byte flow.
///
/// `end_data` marks the final fragment of a logical write; `end_stream`
/// half-closes the sending direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub end_data: bool,
    pub end_stream: bool,
    pub payload: Bytes,
}

impl DataFrame {
    pub fn into_frame(self) -> Frame {
        let mut flags = 0u8;
        if self.end_stream {
            flags |= DATA_END_STREAM;
        }
        if self.end_data {
            flags |= DATA_END_DATA;
        }
        Frame {
            stream_id: self.stream_id,
            kind: FrameKind::Data,
            flags,
            payload: self.payload,
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<DataFrame, WireError> {
        frame.validate_kind(FrameKind::Data, true)?;
        Ok(DataFrame {
            stream_id: frame.stream_id,
            end_stream: frame.flags & DATA_END_STREAM != 0,
            end_data: frame.flags & DATA_END_DATA != 0,
            payload: frame.payload.clone(),
        })
    }
}

/// Splits a buffer into DATA frames of at most [`MAX_DATA_CHUNK`] bytes.
///
/// Only the final chunk carries `end_data`, and only the final chunk
/// carries `end_stream`: a receiver half-closes on the flag, so marking
/// earlier fragments would make it reject the rest of the write.
pub fn data_frames_from_buffer(stream_id: u32, end_stream: bool, buffer: Bytes) -> Vec<DataFrame> {
    if buffer.len() <= MAX_DATA_CHUNK {
        return vec![DataFrame {
            stream_id,
            end_data: true,
            end_stream,
            payload: buffer,
        }];
    }

    let mut frames = Vec::with_capacity(buffer.len() / MAX_DATA_CHUNK + 1);
    let mut written = 0;
    while written < buffer.len() {
        let chunk = (buffer.len() - written).min(MAX_DATA_CHUNK);
        let last = written + chunk == buffer.len();
        frames.push(DataFrame {
            stream_id,
            end_data: last,
            end_stream: end_stream && last,
            payload: buffer.slice(written..written + chunk),
        });
        written += chunk;
    }
    frames
}

//! # arf-wire
//!
//! Framed wire protocol for arf.
//!
//! This crate provides:
//! - The fixed-magic frame codec with optional per-frame DEFLATE
//! - Typed frame views with size and association validation
//! - Per-stream state machines with half-close semantics
//! - The backpressured block reader bridging frames to consumer reads
//! - The connection engine: handshake, ping, GO_AWAY, multiplexing and
//!   single-writer serialization for both connection roles

pub mod block_reader;
pub mod compression;
pub mod conn;
pub mod error;
pub mod frame;
pub mod frame_reader;
pub mod stream;

pub use block_reader::{BlockReader, BLOCK_QUEUE_CAPACITY};
pub use compression::CompressionMethod;
pub use conn::{ConnConfig, ConnRole, Connection, StreamHandler};
pub use error::{ErrorCode, WireError};
pub use frame::{
    data_frames_from_buffer, DataFrame, Frame, FrameKind, GoAwayFrame, HelloFrame,
    MakeStreamFrame, PingFrame, ResetStreamFrame, FRAME_HEADER_SIZE, MAGIC, MAX_DATA_CHUNK,
    MAX_PAYLOAD,
};
pub use frame_reader::FrameReader;
pub use stream::{Stream, StreamStateCode};

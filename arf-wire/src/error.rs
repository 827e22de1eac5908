//! Wire-level error codes and error types.

use crate::frame::FrameKind;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error codes carried by GO_AWAY and RESET_STREAM frames.
///
/// Codes are part of the protocol contract; unknown codes round-trip as
/// their raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    EnhanceYourCalm,
    InadequateSecurity,
    Unknown(u32),
}

impl ErrorCode {
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::NoError => 0x00,
            ErrorCode::ProtocolError => 0x01,
            ErrorCode::InternalError => 0x02,
            ErrorCode::StreamClosed => 0x03,
            ErrorCode::FrameSizeError => 0x04,
            ErrorCode::RefusedStream => 0x05,
            ErrorCode::Cancel => 0x06,
            ErrorCode::CompressionError => 0x07,
            ErrorCode::EnhanceYourCalm => 0x08,
            ErrorCode::InadequateSecurity => 0x09,
            ErrorCode::Unknown(code) => *code,
        }
    }

    pub fn from_u32(code: u32) -> ErrorCode {
        match code {
            0x00 => ErrorCode::NoError,
            0x01 => ErrorCode::ProtocolError,
            0x02 => ErrorCode::InternalError,
            0x03 => ErrorCode::StreamClosed,
            0x04 => ErrorCode::FrameSizeError,
            0x05 => ErrorCode::RefusedStream,
            0x06 => ErrorCode::Cancel,
            0x07 => ErrorCode::CompressionError,
            0x08 => ErrorCode::EnhanceYourCalm,
            0x09 => ErrorCode::InadequateSecurity,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NoError => f.write_str("No error"),
            ErrorCode::ProtocolError => f.write_str("Protocol error"),
            ErrorCode::InternalError => f.write_str("Internal error"),
            ErrorCode::StreamClosed => f.write_str("Stream closed"),
            ErrorCode::FrameSizeError => f.write_str("Frame size error"),
            ErrorCode::RefusedStream => f.write_str("Refused stream"),
            ErrorCode::Cancel => f.write_str("Cancel"),
            ErrorCode::CompressionError => f.write_str("Compression error"),
            ErrorCode::EnhanceYourCalm => f.write_str("Enhance your calm"),
            ErrorCode::InadequateSecurity => f.write_str("Inadequate security"),
            ErrorCode::Unknown(code) => write!(f, "unknown error 0x{:02x}", code),
        }
    }
}

/// Errors surfaced by the wire layer.
///
/// `Clone` because stream and connection faults are replayed to every
/// subsequent operation on the poisoned object.
#[derive(Debug, Error, Clone)]
pub enum WireError {
    #[error("stream is closed")]
    ClosedStream,

    #[error("stream reset: {0}")]
    StreamReset(ErrorCode),

    #[error("stream canceled: {0}")]
    StreamCanceled(ErrorCode),

    #[error("connection reset: {code}: {details}")]
    ConnectionReset { code: ErrorCode, details: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection handshake not complete")]
    NotConfigured,

    #[error("magic number mismatch")]
    MagicMismatch,

    #[error("unknown frame kind 0x{0:02x}")]
    UnknownFrameKind(u8),

    #[error("frame type mismatch: expected {expected}, got {received}")]
    FrameKindMismatch {
        expected: FrameKind,
        received: FrameKind,
    },

    #[error("frame {0} must be associated to a stream")]
    UnassociatedFrame(FrameKind),

    #[error("frame {0} must not be associated to a stream")]
    AssociatedFrame(FrameKind),

    #[error("{0}")]
    InvalidFrameLength(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("frame payload too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::Io(Arc::new(err))
    }
}

impl WireError {
    /// Connection reset with a default description derived from the code.
    pub fn connection_reset(code: ErrorCode) -> WireError {
        WireError::ConnectionReset {
            code,
            details: code.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for raw in 0x00..=0x09u32 {
            assert_eq!(ErrorCode::from_u32(raw).code(), raw);
        }
        assert_eq!(ErrorCode::from_u32(0xBEEF), ErrorCode::Unknown(0xBEEF));
        assert_eq!(ErrorCode::Unknown(0xBEEF).code(), 0xBEEF);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::Cancel.to_string(), "Cancel");
        assert_eq!(ErrorCode::Unknown(0x2A).to_string(), "unknown error 0x2a");
    }

    #[test]
    fn test_stream_reset_display() {
        let err = WireError::StreamReset(ErrorCode::Cancel);
        assert_eq!(err.to_string(), "stream reset: Cancel");
    }
}

//! Codec error types.

use crate::value::TypeTag;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while decoding a value.
///
/// Decode errors are local to the value being read; they abort the enclosing
/// message but carry no connection-level meaning. The type is `Clone` so a
/// failed decode can be reported to more than one waiter.
#[derive(Debug, Error, Clone)]
pub enum DecodeError {
    #[error("unknown type 0x{0:02x}")]
    UnknownType(u8),

    #[error("expected type {expected}, got {actual}")]
    TypeMismatch { expected: TypeTag, actual: TypeTag },

    #[error("unknown struct id {0:?}")]
    UnknownStructId(String),

    #[error("struct id mismatch: expected {expected:?}, got {actual:?}")]
    StructIdMismatch { expected: String, actual: String },

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("varint does not fit in 64 bits")]
    VarintOverflow,

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for DecodeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            DecodeError::UnexpectedEof
        } else {
            DecodeError::Io(Arc::new(err))
        }
    }
}

impl DecodeError {
    /// Returns whether this error indicates a truncated input rather than a
    /// malformed one. Incremental decoders retry after buffering more bytes.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeError::UnexpectedEof)
    }
}

//! Envelope error types.

use crate::message::MessageKind;
use arf_proto::DecodeError;
use thiserror::Error;

/// Errors produced while reading or interpreting envelope messages.
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    #[error("expected kind {expected}, got {received}")]
    KindMismatch {
        expected: MessageKind,
        received: MessageKind,
    },

    #[error("cannot decode message kind 0x{0:02x}")]
    InvalidKind(u8),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("no incoming stream from peer")]
    NoRecvStream,

    #[error("no outgoing stream to peer")]
    NoSendStream,

    #[error("stream failed: {0}")]
    StreamFailure(String),
}

//! Top-level error type for the client and server facades.

use arf_proto::DecodeError;
use arf_rpc::{BadStatus, RpcError};
use arf_wire::WireError;
use std::sync::Arc;
use thiserror::Error;

/// Any failure surfaced by a call or by the facades.
///
/// `Clone` because a failed call replays its error to every later
/// operation on the same context.
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Status(#[from] BadStatus),

    #[error("call canceled")]
    Canceled,

    #[error("operation timed out")]
    Timeout,

    #[error("service {0} already registered")]
    ServiceExists(String),

    #[error("server is not listening")]
    NotListening,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Rpc(RpcError::Decode(err))
    }
}

impl Error {
    /// The application status equivalent of this error, used when a server
    /// handler fails: `BadStatus` passes through, everything else maps to
    /// an internal error with the message preserved.
    pub fn to_bad_status(&self) -> BadStatus {
        match self {
            Error::Status(bad) => bad.clone(),
            Error::Canceled => BadStatus::new(arf_rpc::Status::Cancelled, "call canceled"),
            other => BadStatus::new(arf_rpc::Status::InternalError, other.to_string()),
        }
    }
}

//! # arf-rpc
//!
//! RPC message envelope for arf.
//!
//! This crate provides:
//! - The message kinds riding a stream (request, response, stream control)
//! - Metadata: an ordered multimap of string keys to byte values
//! - Application status codes and the rich `BadStatus` error
//! - An incremental decoder turning stream bytes into messages

mod binary;
pub mod codec;
pub mod error;
pub mod message;
pub mod metadata;
pub mod status;

pub use codec::MessageDecoder;
pub use error::RpcError;
pub use message::{
    Message, MessageKind, Request, Response, StreamError, StreamItem, StreamMetadata,
};
pub use metadata::{Metadata, MetadataPair};
pub use status::{BadStatus, Status, STATUS_DESCRIPTION_KEY};

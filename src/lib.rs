//! # arf
//!
//! A multiplexed binary RPC framework over TCP, with optional TLS.
//!
//! The public surface lives here: [`dial`] and [`Client`] for the caller
//! side, [`listen`] and [`Server`] for the serving side, and
//! [`CallContext`] bridging the wire protocol to per-call request,
//! response and streaming APIs. The protocol internals live in the
//! member crates, re-exported as [`proto`], [`rpc`] and [`wire`].

pub mod cancel;
pub mod client;
pub mod context;
pub mod error;
pub mod server;
pub mod service;
pub mod stream;
pub mod streamer;
pub mod tls;

pub use arf_proto as proto;
pub use arf_rpc as rpc;
pub use arf_wire as wire;

pub use arf_proto::{ArfStruct, FromValue, ToValue, Value};
pub use arf_rpc::{BadStatus, Metadata, Request, Response, Status};
pub use cancel::CancelToken;
pub use client::{dial, CallOptions, Client, ClientOptions, MetadataBuffer};
pub use context::CallContext;
pub use error::Error;
pub use server::{listen, Server, ServerOptions};
pub use service::{BoxFuture, Interceptor, Next, Service, ServiceAdapter};
pub use streamer::{in_out_streams, InStream, OutStream};
pub use tls::{TlsClientConfig, TlsServerConfig};

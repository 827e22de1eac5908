//! Typed streaming adapters over a call context.

use crate::context::CallContext;
use crate::error::Error;
use arf_proto::{FromValue, ToValue};
use arf_rpc::RpcError;
use std::marker::PhantomData;

/// Typed view of the peer's stream.
pub struct InStream<T: FromValue> {
    ctx: CallContext,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromValue> InStream<T> {
    pub fn new(ctx: &CallContext) -> Self {
        Self {
            ctx: ctx.clone(),
            _marker: PhantomData,
        }
    }

    /// Receives the next item, converted to `T`. `Ok(None)` at end of
    /// stream; an item that cannot convert fails the call.
    pub async fn recv(&self) -> Result<Option<T>, Error> {
        match self.ctx.recv().await? {
            None => Ok(None),
            Some(value) => match T::from_value(&value) {
                Some(item) => Ok(Some(item)),
                None => Err(RpcError::StreamFailure(
                    "stream item has an unexpected shape".to_string(),
                )
                .into()),
            },
        }
    }
}

/// Typed view of the local stream.
pub struct OutStream<T: ToValue> {
    ctx: CallContext,
    _marker: PhantomData<fn(T)>,
}

impl<T: ToValue> OutStream<T> {
    pub fn new(ctx: &CallContext) -> Self {
        Self {
            ctx: ctx.clone(),
            _marker: PhantomData,
        }
    }

    pub async fn send(&self, item: &T) -> Result<(), Error> {
        self.ctx.send(item.to_value()).await
    }

    /// Ends the stream; no further sends are possible.
    pub async fn close(&self) -> Result<(), Error> {
        self.ctx.end_send().await
    }
}

/// Builds both typed views for a bidirectional exchange.
pub fn in_out_streams<I: FromValue, O: ToValue>(
    ctx: &CallContext,
) -> (InStream<I>, OutStream<O>) {
    (InStream::new(ctx), OutStream::new(ctx))
}

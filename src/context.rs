//! Per-call context.
//!
//! A `CallContext` bridges one wire stream to the envelope semantics of a
//! call: the request and response, plus the optional streams in each
//! direction. It is cheaply clonable so a call can send and receive
//! concurrently; the receive and send sides are serialized independently.

use crate::cancel::CancelToken;
use crate::error::Error;
use arf_proto::Value;
use arf_rpc::{
    Message, MessageDecoder, Metadata, Request, Response, RpcError, Status, StreamError,
    StreamItem,
};
use arf_wire::{ErrorCode, Stream, WireError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

#[derive(Default)]
struct RecvState {
    decoder: MessageDecoder,
    has_stream: bool,
    started: bool,
    ended: bool,
    err: Option<Error>,
}

#[derive(Default)]
struct SendState {
    has_stream: bool,
    started: bool,
    sent_response: bool,
}

struct CtxShared {
    stream: Stream,
    cancel: CancelToken,
    req: RwLock<Request>,
    resp: RwLock<Option<Response>>,
    fatal: Mutex<Option<Error>>,
    recv: tokio::sync::Mutex<RecvState>,
    send: tokio::sync::Mutex<SendState>,
}

/// Per-call state shared by both directions of the exchange.
#[derive(Clone)]
pub struct CallContext {
    shared: Arc<CtxShared>,
}

impl CallContext {
    /// Caller-side context: the request is known, the response arrives via
    /// [`CallContext::read_response`].
    pub(crate) fn client(stream: Stream, req: Request, cancel: CancelToken) -> CallContext {
        let send = SendState {
            has_stream: req.streaming,
            ..Default::default()
        };
        CallContext {
            shared: Arc::new(CtxShared {
                stream,
                cancel,
                req: RwLock::new(req),
                resp: RwLock::new(None),
                fatal: Mutex::new(None),
                recv: tokio::sync::Mutex::new(RecvState::default()),
                send: tokio::sync::Mutex::new(send),
            }),
        }
    }

    /// Server-side context: the request arrives via
    /// [`CallContext::read_request`], responses go out through
    /// [`CallContext::send_response`].
    pub(crate) fn server(stream: Stream, cancel: CancelToken) -> CallContext {
        CallContext {
            shared: Arc::new(CtxShared {
                stream,
                cancel,
                req: RwLock::new(Request::default()),
                resp: RwLock::new(None),
                fatal: Mutex::new(None),
                recv: tokio::sync::Mutex::new(RecvState::default()),
                send: tokio::sync::Mutex::new(SendState::default()),
            }),
        }
    }

    /// The request that opened this call.
    pub fn request(&self) -> Request {
        self.shared.req.read().clone()
    }

    /// The response, once one has been read (caller side).
    pub fn response(&self) -> Option<Response> {
        self.shared.resp.read().clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// The application-assigned id of the call's stream.
    pub fn external_id(&self) -> String {
        self.shared.stream.external_id()
    }

    fn fatal_error(&self) -> Option<Error> {
        self.shared.fatal.lock().clone()
    }

    fn set_fatal(&self, err: &Error) {
        let mut fatal = self.shared.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err.clone());
        }
    }

    fn fail(&self, err: Error) -> Error {
        self.set_fatal(&err);
        err
    }

    /// Reads stream bytes until the decoder yields one message.
    async fn next_message(&self, rs: &mut RecvState) -> Result<Message, Error> {
        loop {
            match rs.decoder.try_next() {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {}
                Err(err) => return Err(self.fail(err.into())),
            }

            let mut chunk = [0u8; 4096];
            let read = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => {
                    return Err(self.cancel_stream().await);
                }
                result = self.shared.stream.read(&mut chunk) => result,
            };
            match read {
                Ok(0) => return Err(self.fail(WireError::ClosedStream.into())),
                Ok(n) => rs.decoder.extend(&chunk[..n]),
                Err(err) => return Err(self.fail(err.into())),
            }
        }
    }

    /// Writes one wrapped message onto the stream.
    async fn write_message(&self, msg: &Message, end_stream: bool) -> Result<(), Error> {
        let data = msg.wrap();
        let write = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => {
                return Err(self.cancel_stream().await);
            }
            result = self.shared.stream.write(&data, end_stream) => result,
        };
        write.map_err(|err| self.fail(err.into()))
    }

    async fn cancel_stream(&self) -> Error {
        if let Err(err) = self.shared.stream.reset(ErrorCode::Cancel).await {
            tracing::debug!(stream_id = self.shared.stream.id(), %err, "cancel reset failed");
        }
        self.fail(Error::Canceled)
    }

    /// Reads the response that answers the request (caller side).
    pub(crate) async fn read_response(&self) -> Result<Response, Error> {
        if let Some(err) = self.fatal_error() {
            return Err(err);
        }
        let mut rs = self.shared.recv.lock().await;
        let msg = self.next_message(&mut rs).await?;
        let resp = msg.into_response().map_err(|err| self.fail(err.into()))?;
        rs.has_stream = resp.streaming;
        *self.shared.resp.write() = Some(resp.clone());
        Ok(resp)
    }

    /// Reads the request that opens the call (server side).
    pub(crate) async fn read_request(&self) -> Result<Request, Error> {
        if let Some(err) = self.fatal_error() {
            return Err(err);
        }
        let mut rs = self.shared.recv.lock().await;
        let msg = self.next_message(&mut rs).await?;
        let req = msg.into_request().map_err(|err| self.fail(err.into()))?;
        rs.has_stream = req.streaming;
        *self.shared.req.write() = req.clone();
        Ok(req)
    }

    /// Receives the next item of the peer's stream.
    ///
    /// Returns `Ok(None)` once the peer ends the stream cleanly. A stream
    /// error or reset is returned from this and every subsequent call.
    pub async fn recv(&self) -> Result<Option<Value>, Error> {
        if let Some(err) = self.fatal_error() {
            return Err(err);
        }
        let mut rs = self.shared.recv.lock().await;
        if !rs.has_stream {
            return Err(RpcError::NoRecvStream.into());
        }
        if let Some(err) = &rs.err {
            return Err(err.clone());
        }
        if rs.ended {
            return Ok(None);
        }

        if !rs.started {
            match self.next_message(&mut rs).await? {
                Message::StartStream => rs.started = true,
                other => {
                    tracing::debug!(kind = %other.kind(), "expected StartStream");
                    return Err(self.fail(unexpected_kind()));
                }
            }
        }

        loop {
            match self.next_message(&mut rs).await? {
                Message::StreamItem(item) => return Ok(Some(item.value)),
                Message::EndStream => {
                    rs.ended = true;
                    return Ok(None);
                }
                Message::StreamError(stream_error) => {
                    let err = Error::Status(stream_error.to_bad_status());
                    rs.err = Some(err.clone());
                    return Err(err);
                }
                Message::StreamMetadata(stream_metadata) => {
                    let mut resp = self.shared.resp.write();
                    match resp.as_mut() {
                        Some(resp) => resp.metadata = stream_metadata.metadata,
                        None => {
                            tracing::debug!("stream metadata received without a response; dropped")
                        }
                    }
                }
                other => {
                    tracing::debug!(kind = %other.kind(), "unexpected message kind mid-stream");
                    return Err(self.fail(unexpected_kind()));
                }
            }
        }
    }

    /// Sends one item on the local stream, starting it if necessary.
    pub async fn send(&self, value: Value) -> Result<(), Error> {
        if let Some(err) = self.fatal_error() {
            return Err(err);
        }
        let mut ss = self.shared.send.lock().await;
        if !ss.has_stream {
            return Err(RpcError::NoSendStream.into());
        }
        if !ss.started {
            self.write_message(&Message::StartStream, false).await?;
            ss.started = true;
        }
        self.write_message(&Message::StreamItem(StreamItem { value }), false)
            .await
    }

    /// Ends the local stream, half-closing the underlying wire stream.
    pub async fn end_send(&self) -> Result<(), Error> {
        if let Some(err) = self.fatal_error() {
            return Err(err);
        }
        let ss = self.shared.send.lock().await;
        if !ss.has_stream {
            return Err(RpcError::NoSendStream.into());
        }
        drop(ss);
        self.write_message(&Message::EndStream, true).await
    }

    /// Emits metadata mid-stream without ending it.
    pub async fn send_metadata(&self, metadata: Metadata) -> Result<(), Error> {
        if let Some(err) = self.fatal_error() {
            return Err(err);
        }
        let mut ss = self.shared.send.lock().await;
        if !ss.has_stream {
            return Err(RpcError::NoSendStream.into());
        }
        if !ss.started {
            self.write_message(&Message::StartStream, false).await?;
            ss.started = true;
        }
        self.write_message(
            &Message::StreamMetadata(arf_rpc::StreamMetadata { metadata }),
            false,
        )
        .await
    }

    /// Sends the response (server side). A streaming response leaves the
    /// stream open for subsequent [`CallContext::send`] calls.
    pub async fn send_response(
        &self,
        code: Status,
        params: Vec<Value>,
        streaming: bool,
        metadata: Metadata,
    ) -> Result<(), Error> {
        let resp = Response {
            status: code.code(),
            streaming,
            metadata,
            params,
        };
        let mut ss = self.shared.send.lock().await;
        ss.sent_response = true;
        ss.has_stream = streaming;
        ss.started = false;
        self.write_message(&Message::Response(resp), !streaming)
            .await
    }

    /// Terminates an already-started outbound stream with an error.
    pub(crate) async fn send_stream_error(
        &self,
        status: Status,
        metadata: Metadata,
    ) -> Result<(), Error> {
        self.write_message(
            &Message::StreamError(StreamError {
                status: status.code(),
                metadata,
            }),
            true,
        )
        .await
    }

    /// Marks the caller's stream started after the call wrote StartStream.
    pub(crate) async fn mark_send_started(&self) {
        self.shared.send.lock().await.started = true;
    }

    pub(crate) async fn has_sent_response(&self) -> bool {
        self.shared.send.lock().await.sent_response
    }

    pub(crate) async fn send_stream_started(&self) -> bool {
        let ss = self.shared.send.lock().await;
        ss.has_stream && ss.started
    }

    pub(crate) fn stream(&self) -> &Stream {
        &self.shared.stream
    }
}

fn unexpected_kind() -> Error {
    RpcError::StreamFailure("received unexpected message kind".to_string()).into()
}

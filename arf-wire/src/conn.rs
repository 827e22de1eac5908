//! Connection engine.
//!
//! One engine drives one transport connection for either role. A single
//! reader task deserializes inbound frames and dispatches by stream id; a
//! single writer task drains the outbound queue in FIFO order so no stream
//! can starve another. Every outbound write reports success or failure
//! through a per-write result channel.

use crate::compression::CompressionMethod;
use crate::error::{ErrorCode, WireError};
use crate::frame::{
    DataFrame, Frame, FrameKind, GoAwayFrame, HelloFrame, MakeStreamFrame, PingFrame,
    ResetStreamFrame,
};
use crate::frame_reader::FrameReader;
use crate::stream::{Stream, StreamStateCode};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Notify};

/// Capacity of the outbound frame queue.
const OUTBOUND_QUEUE_CAPACITY: usize = 128;

/// Which side of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Client,
    Server,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub role: ConnRole,
    /// Server side: whether a peer's DEFLATE request is honored.
    pub accept_deflate: bool,
    /// Server side: advertised stream limit, `0` = unlimited (reserved).
    pub max_concurrent_streams: u32,
}

impl ConnConfig {
    pub fn client() -> Self {
        Self {
            role: ConnRole::Client,
            accept_deflate: true,
            max_concurrent_streams: 0,
        }
    }

    pub fn server() -> Self {
        Self {
            role: ConnRole::Server,
            accept_deflate: true,
            max_concurrent_streams: 0,
        }
    }
}

/// Receives streams opened by the peer.
///
/// Implementations must not block: stream servicing is expected to run in
/// its own task.
pub trait StreamHandler: Send + Sync + 'static {
    fn service_stream(&self, stream: Stream);

    /// Called when the peer resets a stream that was previously handed to
    /// [`StreamHandler::service_stream`].
    fn cancel_stream(&self, _stream: Stream) {}
}

pub(crate) struct OutboundFrame {
    pub(crate) frame: Frame,
    pub(crate) result: oneshot::Sender<Result<(), WireError>>,
    pub(crate) terminate_after: bool,
}

/// Clonable handle enqueueing frames onto the connection's writer task.
#[derive(Clone)]
pub(crate) struct FrameSink {
    tx: mpsc::Sender<OutboundFrame>,
    err: Arc<OnceLock<WireError>>,
}

impl FrameSink {
    pub(crate) fn new(tx: mpsc::Sender<OutboundFrame>, err: Arc<OnceLock<WireError>>) -> Self {
        Self { tx, err }
    }

    pub(crate) async fn send(&self, frame: Frame) -> Result<(), WireError> {
        self.send_inner(frame, false).await
    }

    /// Sends a frame that triggers local shutdown once its bytes reach the
    /// socket.
    pub(crate) async fn send_terminal(&self, frame: Frame) -> Result<(), WireError> {
        self.send_inner(frame, true).await
    }

    async fn send_inner(&self, frame: Frame, terminate_after: bool) -> Result<(), WireError> {
        if let Some(err) = self.err.get() {
            return Err(err.clone());
        }

        let (result_tx, result_rx) = oneshot::channel();
        let out = OutboundFrame {
            frame,
            result: result_tx,
            terminate_after,
        };
        if self.tx.send(out).await.is_err() {
            return Err(self.conn_error());
        }
        match result_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.conn_error()),
        }
    }

    fn conn_error(&self) -> WireError {
        self.err
            .get()
            .cloned()
            .unwrap_or(WireError::ConnectionClosed)
    }
}

#[derive(Default)]
struct StreamTable {
    map: HashMap<u32, Stream>,
    last_id: u32,
}

struct ConnShared {
    id: u64,
    config: ConnConfig,
    sink: FrameSink,
    err: Arc<OnceLock<WireError>>,
    compression: RwLock<CompressionMethod>,
    configured: AtomicBool,
    running: AtomicBool,
    streams: RwLock<StreamTable>,
    handler: Option<Arc<dyn StreamHandler>>,
    hello_ok: Notify,
    hello_seen: AtomicBool,
    peer_max_streams: AtomicU32,
    shutdown: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

/// Handle to a running connection engine.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

impl Connection {
    /// Starts the reader and writer tasks for `io` and returns the handle.
    pub fn spawn<S>(
        io: S,
        id: u64,
        config: ConnConfig,
        handler: Option<Arc<dyn StreamHandler>>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);
        let err = Arc::new(OnceLock::new());

        let shared = Arc::new(ConnShared {
            id,
            config,
            sink: FrameSink::new(outbound_tx, err.clone()),
            err,
            compression: RwLock::new(CompressionMethod::None),
            configured: AtomicBool::new(false),
            running: AtomicBool::new(true),
            streams: RwLock::new(StreamTable::default()),
            handler,
            hello_ok: Notify::new(),
            hello_seen: AtomicBool::new(false),
            peer_max_streams: AtomicU32::new(0),
            shutdown: shutdown_tx,
            closed: closed_tx,
        });

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            shared.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_loop(read_half, shared.clone(), shutdown_rx));

        Connection { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Performs the client handshake: sends HELLO and waits for the ack.
    pub async fn configure(&self, compression: CompressionMethod) -> Result<(), WireError> {
        if self.shared.config.role != ConnRole::Client {
            return Err(WireError::InvalidFrame(
                "configure is a client-side operation".to_string(),
            ));
        }

        let acked = self.shared.hello_ok.notified();
        tokio::pin!(acked);
        acked.as_mut().enable();

        let hello = HelloFrame {
            ack: false,
            deflate: compression == CompressionMethod::Deflate,
            max_concurrent_streams: 0,
        };
        self.shared.sink.send(hello.into_frame()).await?;

        if self.shared.hello_seen.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut closed_rx = self.shared.closed.subscribe();
        if *closed_rx.borrow() {
            return Err(self.shared.conn_error());
        }
        tokio::select! {
            _ = &mut acked => Ok(()),
            _ = closed_rx.changed() => Err(self.shared.conn_error()),
        }
    }

    /// Opens a new stream. Ids are allocated monotonically under the stream
    /// table lock; the stream is registered before MAKE_STREAM is written so
    /// a fast peer reply cannot race the table.
    pub async fn new_stream(&self) -> Result<Stream, WireError> {
        if let Some(err) = self.shared.err.get() {
            return Err(err.clone());
        }
        if !self.shared.configured.load(Ordering::Acquire) {
            return Err(WireError::NotConfigured);
        }

        let (id, stream) = {
            let mut table = self.shared.streams.write();
            table.last_id += 1;
            let id = table.last_id;
            let stream = Stream::new(id, self.shared.sink.clone());
            table.map.insert(id, stream.clone());
            (id, stream)
        };

        match self
            .shared
            .sink
            .send(MakeStreamFrame { stream_id: id }.into_frame())
            .await
        {
            Ok(()) => Ok(stream),
            Err(err) => {
                self.shared.streams.write().map.remove(&id);
                Err(err)
            }
        }
    }

    /// Announces termination with GO_AWAY; the connection shuts down locally
    /// once the frame has been flushed.
    pub async fn go_away(&self, code: ErrorCode) -> Result<(), WireError> {
        let frame = GoAwayFrame {
            last_stream_id: self.shared.streams.read().last_id,
            error_code: code,
            additional_data: Bytes::new(),
        };
        self.shared.sink.send_terminal(frame.into_frame()).await
    }

    /// Tears the connection down immediately.
    pub fn close(&self) {
        self.shared.terminate();
    }

    /// Resolves once the connection has terminated.
    pub async fn closed(&self) {
        let mut closed_rx = self.shared.closed.subscribe();
        if *closed_rx.borrow() {
            return;
        }
        let _ = closed_rx.changed().await;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The connection-level error recorded at teardown, if any.
    pub fn error(&self) -> Option<WireError> {
        self.shared.err.get().cloned()
    }

    /// Stream limit advertised by the peer's HELLO ack (reserved).
    pub fn peer_max_concurrent_streams(&self) -> u32 {
        self.shared.peer_max_streams.load(Ordering::Acquire)
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.read().map.len()
    }
}

impl ConnShared {
    fn record_error(&self, err: WireError) {
        let _ = self.err.set(err);
    }

    fn conn_error(&self) -> WireError {
        self.err
            .get()
            .cloned()
            .unwrap_or(WireError::ConnectionClosed)
    }

    fn terminate(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);

        let streams: Vec<Stream> = {
            let mut table = self.streams.write();
            table.map.drain().map(|(_, stream)| stream).collect()
        };
        let err = self.conn_error();
        for stream in streams {
            stream.fail(err.clone());
        }

        let _ = self.closed.send(true);
        tracing::debug!(conn = self.id, "connection terminated");
    }

    fn fetch_stream(&self, id: u32) -> Option<Stream> {
        self.streams.read().map.get(&id).cloned()
    }

    /// Drops a stream from the table once both directions have closed.
    fn reap_if_closed(&self, stream: &Stream) {
        if stream.state_code() == StreamStateCode::Closed {
            self.streams.write().map.remove(&stream.id());
        }
    }

    async fn go_away(&self, code: ErrorCode, terminate: bool) {
        let frame = GoAwayFrame {
            last_stream_id: self.streams.read().last_id,
            error_code: code,
            additional_data: Bytes::new(),
        };
        let result = if terminate {
            self.sink.send_terminal(frame.into_frame()).await
        } else {
            self.sink.send(frame.into_frame()).await
        };
        if let Err(err) = result {
            tracing::debug!(conn = self.id, %err, "GO_AWAY write failed");
            self.terminate();
        }
    }

    /// Records a protocol fault and announces it with a terminal GO_AWAY.
    async fn connection_fault(&self, code: ErrorCode, details: impl Into<String>) {
        self.record_error(WireError::ConnectionReset {
            code,
            details: details.into(),
        });
        self.go_away(code, true).await;
    }

    async fn reset_stream(&self, id: u32, code: ErrorCode) {
        let frame = ResetStreamFrame {
            stream_id: id,
            error_code: code,
        };
        if let Err(err) = self.sink.send(frame.into_frame()).await {
            tracing::debug!(conn = self.id, stream_id = id, %err, "RESET_STREAM write failed");
        }
    }

    async fn dispatch(&self, mut frame: Frame) {
        // Handshake frames are exempt from compression; everything else is
        // decompressed with the negotiated method once configured.
        if frame.kind != FrameKind::Hello && self.configured.load(Ordering::Acquire) {
            let method = *self.compression.read();
            if method != CompressionMethod::None {
                if let Err(err) = frame.decompress(method) {
                    tracing::warn!(conn = self.id, %err, "failed to decompress frame payload");
                    self.connection_fault(ErrorCode::CompressionError, err.to_string())
                        .await;
                    return;
                }
            }
        }

        if !self.configured.load(Ordering::Acquire)
            && matches!(frame.kind, FrameKind::Data | FrameKind::MakeStream)
        {
            tracing::warn!(conn = self.id, kind = %frame.kind, "frame received before handshake");
            self.connection_fault(
                ErrorCode::ProtocolError,
                format!("expected a HELLO frame, received {} instead", frame.kind),
            )
            .await;
            return;
        }

        match frame.kind {
            FrameKind::Hello => match HelloFrame::from_frame(&frame) {
                Ok(hello) => self.handle_hello(hello).await,
                Err(err) => self.protocol_fault(err).await,
            },
            FrameKind::Ping => match PingFrame::from_frame(&frame) {
                Ok(ping) => self.handle_ping(ping).await,
                Err(err) => self.protocol_fault(err).await,
            },
            FrameKind::GoAway => match GoAwayFrame::from_frame(&frame) {
                Ok(go_away) => self.handle_go_away(go_away),
                Err(err) => self.protocol_fault(err).await,
            },
            FrameKind::MakeStream => match MakeStreamFrame::from_frame(&frame) {
                Ok(make_stream) => self.handle_make_stream(make_stream).await,
                Err(err) => self.protocol_fault(err).await,
            },
            FrameKind::ResetStream => match ResetStreamFrame::from_frame(&frame) {
                Ok(reset) => self.handle_reset_frame(reset).await,
                Err(err) => self.protocol_fault(err).await,
            },
            FrameKind::Data => match DataFrame::from_frame(&frame) {
                Ok(data) => self.handle_data(data).await,
                Err(err) => self.protocol_fault(err).await,
            },
        }
    }

    async fn protocol_fault(&self, err: WireError) {
        tracing::warn!(conn = self.id, %err, "ill-formed frame");
        self.connection_fault(ErrorCode::ProtocolError, err.to_string())
            .await;
    }

    async fn handle_hello(&self, hello: HelloFrame) {
        if self.configured.load(Ordering::Acquire) {
            self.connection_fault(ErrorCode::ProtocolError, "HELLO after configuration")
                .await;
            return;
        }

        match self.config.role {
            ConnRole::Server => {
                let deflate = hello.deflate && self.config.accept_deflate;
                if deflate {
                    *self.compression.write() = CompressionMethod::Deflate;
                }
                self.configured.store(true, Ordering::Release);
                tracing::debug!(conn = self.id, deflate, "handshake complete");

                let ack = HelloFrame {
                    ack: true,
                    deflate,
                    max_concurrent_streams: self.config.max_concurrent_streams,
                };
                if let Err(err) = self.sink.send(ack.into_frame()).await {
                    tracing::debug!(conn = self.id, %err, "HELLO ack write failed");
                    self.terminate();
                }
            }
            ConnRole::Client => {
                if !hello.ack {
                    self.connection_fault(
                        ErrorCode::ProtocolError,
                        "server emitted a non-ack HELLO frame",
                    )
                    .await;
                    return;
                }
                if hello.deflate {
                    *self.compression.write() = CompressionMethod::Deflate;
                }
                self.peer_max_streams
                    .store(hello.max_concurrent_streams, Ordering::Release);
                self.configured.store(true, Ordering::Release);
                self.hello_seen.store(true, Ordering::Release);
                self.hello_ok.notify_waiters();
                tracing::debug!(conn = self.id, deflate = hello.deflate, "handshake acked");
            }
        }
    }

    async fn handle_ping(&self, ping: PingFrame) {
        if ping.ack {
            // An ack answers one of our own probes; nothing to do.
            return;
        }
        let pong = PingFrame {
            ack: true,
            payload: ping.payload,
        };
        if let Err(err) = self.sink.send(pong.into_frame()).await {
            tracing::debug!(conn = self.id, %err, "PING ack write failed");
            self.record_error(err);
            self.terminate();
        }
    }

    fn handle_go_away(&self, go_away: GoAwayFrame) {
        tracing::debug!(
            conn = self.id,
            code = %go_away.error_code,
            last_stream_id = go_away.last_stream_id,
            "peer sent GO_AWAY"
        );
        self.record_error(WireError::ConnectionReset {
            code: go_away.error_code,
            details: format!(
                "peer closed connection with status {}",
                go_away.error_code
            ),
        });

        let streams: Vec<Stream> = {
            let mut table = self.streams.write();
            table.map.drain().map(|(_, stream)| stream).collect()
        };
        for stream in streams {
            stream.fail(WireError::StreamReset(go_away.error_code));
        }

        self.terminate();
    }

    async fn handle_make_stream(&self, make_stream: MakeStreamFrame) {
        if self.config.role == ConnRole::Client {
            self.connection_fault(ErrorCode::ProtocolError, "peer attempted to open a stream")
                .await;
            return;
        }

        let id = make_stream.stream_id;
        let stream = {
            let mut table = self.streams.write();
            if table.map.contains_key(&id) {
                None
            } else {
                let stream = Stream::new(id, self.sink.clone());
                table.map.insert(id, stream.clone());
                if id > table.last_id {
                    table.last_id = id;
                }
                Some(stream)
            }
        };

        match stream {
            Some(stream) => {
                tracing::debug!(conn = self.id, stream_id = id, "stream opened by peer");
                if let Some(handler) = &self.handler {
                    handler.service_stream(stream);
                }
            }
            None => {
                tracing::warn!(conn = self.id, stream_id = id, "duplicate MAKE_STREAM");
                self.connection_fault(
                    ErrorCode::ProtocolError,
                    format!("duplicate stream id {}", id),
                )
                .await;
            }
        }
    }

    async fn handle_reset_frame(&self, reset: ResetStreamFrame) {
        let Some(stream) = self.fetch_stream(reset.stream_id) else {
            tracing::debug!(
                conn = self.id,
                stream_id = reset.stream_id,
                "RESET_STREAM for unknown stream"
            );
            self.reset_stream(reset.stream_id, ErrorCode::ProtocolError)
                .await;
            return;
        };

        stream.handle_reset(reset).await;
        self.streams.write().map.remove(&reset.stream_id);

        if self.config.role == ConnRole::Server {
            if let Some(handler) = &self.handler {
                handler.cancel_stream(stream);
            }
        }
    }

    async fn handle_data(&self, data: DataFrame) {
        let Some(stream) = self.fetch_stream(data.stream_id) else {
            tracing::debug!(
                conn = self.id,
                stream_id = data.stream_id,
                "DATA for unknown stream"
            );
            self.reset_stream(data.stream_id, ErrorCode::ProtocolError)
                .await;
            return;
        };

        stream.handle_data(data).await;
        self.reap_if_closed(&stream);
    }
}

async fn write_loop<W: AsyncWrite + Send + Unpin>(
    mut w: W,
    mut rx: mpsc::Receiver<OutboundFrame>,
    shared: Arc<ConnShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let out = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            out = rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };

        if let Some(err) = shared.err.get() {
            let _ = out.result.send(Err(err.clone()));
            continue;
        }

        // Handshake frames always go out uncompressed; the negotiated
        // method applies to every later frame.
        let method = if out.frame.kind == FrameKind::Hello {
            CompressionMethod::None
        } else {
            *shared.compression.read()
        };

        let encoded = match out.frame.encode(method) {
            Ok(encoded) => encoded,
            Err(err) => {
                let _ = out.result.send(Err(err));
                continue;
            }
        };

        let write_result = async {
            w.write_all(&encoded).await?;
            w.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        match write_result {
            Ok(()) => {
                let terminate_after = out.terminate_after;
                let _ = out.result.send(Ok(()));
                if terminate_after {
                    shared.terminate();
                    break;
                }
            }
            Err(err) => {
                let err = WireError::from(err);
                tracing::debug!(conn = shared.id, %err, "socket write failed");
                shared.record_error(err.clone());
                let _ = out.result.send(Err(err));
                shared.terminate();
                break;
            }
        }
    }

    // Fail anything still queued, then close the socket's write side.
    rx.close();
    while let Some(out) = rx.recv().await {
        let _ = out.result.send(Err(shared.conn_error()));
    }
    let _ = w.shutdown().await;
}

async fn read_loop<R: AsyncRead + Send + Unpin>(
    r: R,
    shared: Arc<ConnShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = FrameReader::new(r);
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = reader.read() => result,
        };

        match result {
            Ok(frame) => shared.dispatch(frame).await,
            Err(err @ (WireError::MagicMismatch | WireError::UnknownFrameKind(_))) => {
                shared.protocol_fault(err).await;
                break;
            }
            Err(err) => {
                tracing::debug!(conn = shared.id, %err, "socket read failed");
                shared.record_error(err);
                shared.terminate();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_PAYLOAD;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::{timeout, Duration};

    struct ChannelHandler {
        tx: mpsc::UnboundedSender<Stream>,
    }

    impl StreamHandler for ChannelHandler {
        fn service_stream(&self, stream: Stream) {
            let _ = self.tx.send(stream);
        }
    }

    fn spawn_server(io: DuplexStream) -> (Connection, UnboundedReceiver<Stream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::spawn(
            io,
            1,
            ConnConfig::server(),
            Some(Arc::new(ChannelHandler { tx })),
        );
        (conn, rx)
    }

    struct RawPeer {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl RawPeer {
        fn new(io: DuplexStream) -> Self {
            let (read_half, write_half) = tokio::io::split(io);
            Self {
                reader: FrameReader::new(read_half),
                writer: write_half,
            }
        }

        async fn send(&mut self, frame: Frame) {
            let encoded = frame.encode(CompressionMethod::None).unwrap();
            self.writer.write_all(&encoded).await.unwrap();
        }

        async fn recv(&mut self) -> Frame {
            timeout(Duration::from_secs(1), self.reader.read())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
        }

        async fn handshake(&mut self) {
            self.send(
                HelloFrame {
                    ack: false,
                    deflate: false,
                    max_concurrent_streams: 0,
                }
                .into_frame(),
            )
            .await;
            let ack = HelloFrame::from_frame(&self.recv().await).unwrap();
            assert!(ack.ack);
        }
    }

    #[tokio::test]
    async fn test_handshake_and_ping_echo() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (_server, _streams) = spawn_server(server_io);
        let mut peer = RawPeer::new(client_io);

        peer.handshake().await;

        let payload = Bytes::from_static(&[7, 6, 5, 4, 3, 2, 1, 0]);
        // An ack PING first: it must not be answered.
        peer.send(
            PingFrame {
                ack: true,
                payload: Bytes::from_static(&[9; 8]),
            }
            .into_frame(),
        )
        .await;
        peer.send(
            PingFrame {
                ack: false,
                payload: payload.clone(),
            }
            .into_frame(),
        )
        .await;

        let pong = PingFrame::from_frame(&peer.recv().await).unwrap();
        assert!(pong.ack);
        assert_eq!(pong.payload, payload);
    }

    #[tokio::test]
    async fn test_data_before_handshake_is_protocol_error() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server, _streams) = spawn_server(server_io);
        let mut peer = RawPeer::new(client_io);

        peer.send(
            DataFrame {
                stream_id: 1,
                end_data: true,
                end_stream: false,
                payload: Bytes::from_static(b"early"),
            }
            .into_frame(),
        )
        .await;

        let go_away = GoAwayFrame::from_frame(&peer.recv().await).unwrap();
        assert_eq!(go_away.error_code, ErrorCode::ProtocolError);

        timeout(Duration::from_secs(1), server.closed())
            .await
            .unwrap();
        assert!(matches!(
            server.error(),
            Some(WireError::ConnectionReset {
                code: ErrorCode::ProtocolError,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_make_stream_is_protocol_error() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (_server, _streams) = spawn_server(server_io);
        let mut peer = RawPeer::new(client_io);

        peer.handshake().await;
        peer.send(MakeStreamFrame { stream_id: 5 }.into_frame()).await;
        peer.send(MakeStreamFrame { stream_id: 5 }.into_frame()).await;

        let go_away = GoAwayFrame::from_frame(&peer.recv().await).unwrap();
        assert_eq!(go_away.error_code, ErrorCode::ProtocolError);
    }

    #[tokio::test]
    async fn test_data_for_unknown_stream_resets_but_keeps_connection() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server, _streams) = spawn_server(server_io);
        let mut peer = RawPeer::new(client_io);

        peer.handshake().await;
        peer.send(
            DataFrame {
                stream_id: 42,
                end_data: true,
                end_stream: false,
                payload: Bytes::from_static(b"nobody home"),
            }
            .into_frame(),
        )
        .await;

        let reset = ResetStreamFrame::from_frame(&peer.recv().await).unwrap();
        assert_eq!(reset.stream_id, 42);
        assert_eq!(reset.error_code, ErrorCode::ProtocolError);
        assert!(server.is_running());
    }

    async fn connected_pair() -> (Connection, Connection, UnboundedReceiver<Stream>) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let (server, streams) = spawn_server(server_io);
        let client = Connection::spawn(client_io, 2, ConnConfig::client(), None);
        client.configure(CompressionMethod::None).await.unwrap();
        (client, server, streams)
    }

    #[tokio::test]
    async fn test_make_stream_and_data() {
        let (client, _server, mut streams) = connected_pair().await;

        let stream = client.new_stream().await.unwrap();
        assert_eq!(stream.id(), 1);
        stream.write(&[0x01, 0x02, 0x03], false).await.unwrap();

        let server_stream = timeout(Duration::from_secs(1), streams.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server_stream.id(), 1);

        let mut buf = [0u8; 3];
        let mut read = 0;
        while read < 3 {
            read += server_stream.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf, &[0x01, 0x02, 0x03]);
        assert_eq!(server_stream.state_code(), StreamStateCode::Open);
        assert_eq!(stream.state_code(), StreamStateCode::Open);
    }

    #[tokio::test]
    async fn test_large_transfer_roundtrip() {
        let (client, _server, mut streams) = connected_pair().await;

        let stream = client.new_stream().await.unwrap();
        // 16x the maximum frame payload, to exercise sustained chunking.
        let data: Vec<u8> = (0..16 * MAX_PAYLOAD as u32).map(|i| (i % 251) as u8).collect();

        let writer_data = data.clone();
        let writer_stream = stream.clone();
        let writer = tokio::spawn(async move {
            writer_stream.write(&writer_data, false).await.unwrap();
        });

        let server_stream = streams.recv().await.unwrap();
        let mut received = vec![0u8; data.len()];
        let mut read = 0;
        while read < data.len() {
            let n = server_stream.read(&mut received[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        writer.await.unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_deflate_negotiated_transfer() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let (_server, mut streams) = spawn_server(server_io);
        let client = Connection::spawn(client_io, 3, ConnConfig::client(), None);
        client.configure(CompressionMethod::Deflate).await.unwrap();

        let stream = client.new_stream().await.unwrap();
        let data = vec![0x61u8; 100_000];

        let writer_data = data.clone();
        let writer_stream = stream.clone();
        let writer = tokio::spawn(async move {
            writer_stream.write(&writer_data, false).await.unwrap();
        });

        let server_stream = streams.recv().await.unwrap();
        let mut received = vec![0u8; data.len()];
        let mut read = 0;
        while read < data.len() {
            let n = server_stream.read(&mut received[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        writer.await.unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_remote_reset_during_read() {
        let (client, _server, mut streams) = connected_pair().await;

        let stream = client.new_stream().await.unwrap();
        let reading = stream.clone();
        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reading.read(&mut buf).await
        });

        let server_stream = streams.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        server_stream.reset(ErrorCode::Cancel).await.unwrap();

        let result = timeout(Duration::from_secs(1), read_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(WireError::StreamReset(ErrorCode::Cancel))
        ));

        let mut buf = [0u8; 16];
        assert!(matches!(
            stream.read(&mut buf).await,
            Err(WireError::StreamReset(ErrorCode::Cancel))
        ));
    }

    #[tokio::test]
    async fn test_go_away_terminates_both_sides() {
        let (client, server, _streams) = connected_pair().await;

        client.go_away(ErrorCode::NoError).await.unwrap();

        timeout(Duration::from_secs(1), server.closed())
            .await
            .unwrap();
        timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert!(!server.is_running());
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_new_stream_requires_handshake() {
        let (client_io, _server_io) = tokio::io::duplex(64 * 1024);
        let client = Connection::spawn(client_io, 4, ConnConfig::client(), None);
        assert!(matches!(
            client.new_stream().await,
            Err(WireError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_stream_ids_are_monotonic() {
        let (client, _server, _streams) = connected_pair().await;
        for expected in 1..=5u32 {
            let stream = client.new_stream().await.unwrap();
            assert_eq!(stream.id(), expected);
        }
        assert_eq!(client.stream_count(), 5);
    }
}

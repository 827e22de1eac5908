//! Logical streams and their state machines.
//!
//! A stream is a bidirectional byte channel multiplexed within one
//! connection. The state machine guards every send and receive; once a
//! stream records an error, every subsequent operation returns that same
//! error.

use crate::block_reader::BlockReader;
use crate::conn::FrameSink;
use crate::error::{ErrorCode, WireError};
use crate::frame::{data_frames_from_buffer, DataFrame, ResetStreamFrame};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStateCode {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl fmt::Display for StreamStateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamStateCode::Open => "open",
            StreamStateCode::HalfClosedLocal => "half-closed (local)",
            StreamStateCode::HalfClosedRemote => "half-closed (remote)",
            StreamStateCode::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State code plus the sticky error replayed to later operations.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    code: Code,
    err: Option<WireError>,
}

// Default for the state code is the initial Open state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Code {
    #[default]
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub(crate) fn code(&self) -> StreamStateCode {
        match self.code {
            Code::Open => StreamStateCode::Open,
            Code::HalfClosedLocal => StreamStateCode::HalfClosedLocal,
            Code::HalfClosedRemote => StreamStateCode::HalfClosedRemote,
            Code::Closed => StreamStateCode::Closed,
        }
    }

    pub(crate) fn error(&self) -> Option<WireError> {
        self.err.clone()
    }

    pub(crate) fn set_error(&mut self, err: WireError) {
        self.err = Some(err);
    }

    pub(crate) fn close(&mut self) {
        self.code = Code::Closed;
    }

    pub(crate) fn close_local(&mut self) {
        self.code = match self.code {
            Code::Open | Code::HalfClosedLocal => Code::HalfClosedLocal,
            Code::HalfClosedRemote | Code::Closed => Code::Closed,
        };
    }

    pub(crate) fn close_remote(&mut self) {
        self.code = match self.code {
            Code::Open | Code::HalfClosedRemote => Code::HalfClosedRemote,
            Code::HalfClosedLocal | Code::Closed => Code::Closed,
        };
    }

    pub(crate) fn send_data(&self) -> Result<(), WireError> {
        match (&self.err, self.code) {
            (Some(err), _) => Err(err.clone()),
            (None, Code::Closed | Code::HalfClosedLocal) => Err(WireError::ClosedStream),
            _ => Ok(()),
        }
    }

    pub(crate) fn send_reset(&self) -> Result<(), WireError> {
        match (&self.err, self.code) {
            (Some(err), _) => Err(err.clone()),
            (None, Code::Closed | Code::HalfClosedLocal) => Err(WireError::ClosedStream),
            _ => Ok(()),
        }
    }

    pub(crate) fn recv_data(&self) -> Result<(), WireError> {
        match (&self.err, self.code) {
            (Some(err), _) => Err(err.clone()),
            (None, Code::Closed | Code::HalfClosedRemote) => Err(WireError::ClosedStream),
            _ => Ok(()),
        }
    }

    pub(crate) fn recv_reset(&self) -> Result<(), WireError> {
        match (&self.err, self.code) {
            (Some(err), _) => Err(err.clone()),
            (None, Code::Closed) => Err(WireError::ClosedStream),
            _ => Ok(()),
        }
    }
}

struct StreamInner {
    id: u32,
    sink: FrameSink,
    state: Mutex<StreamState>,
    reader: BlockReader,
    write_mu: tokio::sync::Mutex<()>,
    external_id: Mutex<String>,
}

/// One logical stream, shared by the connection dispatcher and a consumer.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(id: u32, sink: FrameSink) -> Stream {
        Stream {
            inner: Arc::new(StreamInner {
                id,
                sink,
                state: Mutex::new(StreamState::default()),
                reader: BlockReader::new(),
                write_mu: tokio::sync::Mutex::new(()),
                external_id: Mutex::new(String::new()),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Application-assigned identifier used to correlate the stream with a
    /// per-call context.
    pub fn external_id(&self) -> String {
        self.inner.external_id.lock().clone()
    }

    pub fn set_external_id(&self, id: impl Into<String>) {
        *self.inner.external_id.lock() = id.into();
    }

    pub fn state_code(&self) -> StreamStateCode {
        self.inner.state.lock().code()
    }

    /// Writes a buffer as one logical message, chunking into DATA frames.
    ///
    /// With `end_stream` the local direction half-closes after the final
    /// chunk.
    pub async fn write(&self, data: &[u8], end_stream: bool) -> Result<(), WireError> {
        self.inner.state.lock().send_data()?;
        let _write_guard = self.inner.write_mu.lock().await;

        let frames =
            data_frames_from_buffer(self.inner.id, end_stream, Bytes::copy_from_slice(data));
        for frame in frames {
            self.inner.sink.send(frame.into_frame()).await?;
        }

        if end_stream {
            self.inner.state.lock().close_local();
        }
        Ok(())
    }

    /// Reads into `into`, suspending until data arrives, the remote side
    /// ends the stream, or the stream fails.
    ///
    /// Returns `Ok(0)` at a clean end-of-stream; a reset or cancellation is
    /// returned as the same error from every subsequent call.
    pub async fn read(&self, into: &mut [u8]) -> Result<usize, WireError> {
        if let Some(err) = self.inner.state.lock().error() {
            return Err(err);
        }

        if let Some(n) = self.inner.reader.try_read(into).await {
            if n == 0 {
                return self.eof_or_error();
            }
            return Ok(n);
        }

        self.inner.state.lock().recv_data()?;

        let n = self.inner.reader.read(into).await;
        if n == 0 {
            return self.eof_or_error();
        }
        Ok(n)
    }

    fn eof_or_error(&self) -> Result<usize, WireError> {
        match self.inner.state.lock().error() {
            Some(err) => Err(err),
            None => Ok(0),
        }
    }

    /// Aborts the stream, notifying the peer with `code`.
    ///
    /// A cancel code records a canceled-stream error so later operations
    /// report the cause.
    pub async fn reset(&self, code: ErrorCode) -> Result<(), WireError> {
        {
            let mut state = self.inner.state.lock();
            state.send_reset()?;
            state.close();
            if code == ErrorCode::Cancel {
                state.set_error(WireError::StreamCanceled(code));
            }
        }
        self.inner.reader.close();
        self.send_reset_frame(code).await
    }

    /// Half-closes the local direction with an empty terminal DATA frame.
    pub async fn close_local(&self) -> Result<(), WireError> {
        {
            let mut state = self.inner.state.lock();
            state.send_data()?;
            state.close_local();
        }
        let _write_guard = self.inner.write_mu.lock().await;
        self.inner
            .sink
            .send(
                DataFrame {
                    stream_id: self.inner.id,
                    end_data: true,
                    end_stream: true,
                    payload: Bytes::new(),
                }
                .into_frame(),
            )
            .await
    }

    async fn send_reset_frame(&self, code: ErrorCode) -> Result<(), WireError> {
        let _write_guard = self.inner.write_mu.lock().await;
        self.inner
            .sink
            .send(
                ResetStreamFrame {
                    stream_id: self.inner.id,
                    error_code: code,
                }
                .into_frame(),
            )
            .await
    }

    /// Dispatcher entry for an inbound DATA frame.
    pub(crate) async fn handle_data(&self, data: DataFrame) {
        if self.inner.state.lock().recv_data().is_err() {
            if let Err(err) = self.send_reset_frame(ErrorCode::StreamClosed).await {
                tracing::debug!(stream_id = self.inner.id, %err, "reset after late DATA failed");
            }
            return;
        }

        if !data.payload.is_empty() {
            self.inner.reader.enqueue(data.payload).await;
        }
        if data.end_stream {
            self.inner.state.lock().close_remote();
        }
    }

    /// Dispatcher entry for an inbound RESET_STREAM frame.
    pub(crate) async fn handle_reset(&self, reset: ResetStreamFrame) {
        if self.inner.state.lock().recv_reset().is_err() {
            if let Err(err) = self.send_reset_frame(ErrorCode::StreamClosed).await {
                tracing::debug!(stream_id = self.inner.id, %err, "reset after late RESET failed");
            }
            return;
        }

        {
            let mut state = self.inner.state.lock();
            state.close();
            state.set_error(WireError::StreamReset(reset.error_code));
        }
        self.inner.reader.close();
    }

    /// Marks the stream failed during connection teardown.
    pub(crate) fn fail(&self, err: WireError) {
        {
            let mut state = self.inner.state.lock();
            if state.error().is_none() {
                state.set_error(err);
            }
            state.close();
        }
        self.inner.reader.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{FrameSink, OutboundFrame};
    use crate::frame::{Frame, FrameKind, MAX_DATA_CHUNK, MAX_PAYLOAD};
    use std::sync::OnceLock;
    use tokio::sync::mpsc;

    // --- state machine table ---

    fn reset_state() -> StreamState {
        let mut state = StreamState::default();
        state.close();
        state.set_error(WireError::StreamReset(ErrorCode::Cancel));
        state
    }

    #[test]
    fn test_send_data_transitions() {
        let open = StreamState::default();
        assert!(open.send_data().is_ok());

        let mut local = StreamState::default();
        local.close_local();
        assert!(matches!(local.send_data(), Err(WireError::ClosedStream)));

        let mut remote = StreamState::default();
        remote.close_remote();
        assert!(remote.send_data().is_ok());

        let mut closed = StreamState::default();
        closed.close();
        assert!(matches!(closed.send_data(), Err(WireError::ClosedStream)));
    }

    #[test]
    fn test_recv_data_transitions() {
        let open = StreamState::default();
        assert!(open.recv_data().is_ok());

        let mut local = StreamState::default();
        local.close_local();
        assert!(local.recv_data().is_ok());

        let mut remote = StreamState::default();
        remote.close_remote();
        assert!(matches!(remote.recv_data(), Err(WireError::ClosedStream)));

        let mut closed = StreamState::default();
        closed.close();
        assert!(matches!(closed.recv_data(), Err(WireError::ClosedStream)));
    }

    #[test]
    fn test_send_reset_transitions() {
        assert!(StreamState::default().send_reset().is_ok());

        let mut local = StreamState::default();
        local.close_local();
        assert!(matches!(local.send_reset(), Err(WireError::ClosedStream)));

        let mut remote = StreamState::default();
        remote.close_remote();
        assert!(remote.send_reset().is_ok());

        let mut closed = StreamState::default();
        closed.close();
        assert!(matches!(closed.send_reset(), Err(WireError::ClosedStream)));
    }

    #[test]
    fn test_recv_reset_transitions() {
        assert!(StreamState::default().recv_reset().is_ok());

        let mut local = StreamState::default();
        local.close_local();
        assert!(local.recv_reset().is_ok());

        let mut remote = StreamState::default();
        remote.close_remote();
        assert!(remote.recv_reset().is_ok());

        let mut closed = StreamState::default();
        closed.close();
        assert!(matches!(closed.recv_reset(), Err(WireError::ClosedStream)));
    }

    #[test]
    fn test_half_close_both_sides_closes() {
        let mut state = StreamState::default();
        state.close_local();
        assert_eq!(state.code(), StreamStateCode::HalfClosedLocal);
        state.close_remote();
        assert_eq!(state.code(), StreamStateCode::Closed);

        let mut state = StreamState::default();
        state.close_remote();
        assert_eq!(state.code(), StreamStateCode::HalfClosedRemote);
        state.close_local();
        assert_eq!(state.code(), StreamStateCode::Closed);
    }

    #[test]
    fn test_error_sticks_for_every_guard() {
        let state = reset_state();
        for result in [
            state.send_data(),
            state.recv_data(),
            state.send_reset(),
            state.recv_reset(),
        ] {
            assert!(matches!(
                result,
                Err(WireError::StreamReset(ErrorCode::Cancel))
            ));
        }
    }

    // --- stream behavior over a mock writer ---

    fn test_sink() -> (FrameSink, mpsc::Receiver<Frame>) {
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(16);
        let (frame_tx, frame_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let _ = frame_tx.send(out.frame).await;
                let _ = out.result.send(Ok(()));
            }
        });
        (FrameSink::new(tx, Arc::new(OnceLock::new())), frame_rx)
    }

    #[tokio::test]
    async fn test_write_small_buffer() {
        let (sink, mut frames) = test_sink();
        let stream = Stream::new(1, sink);

        stream.write(&[1, 2, 3], false).await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.stream_id, 1);
        assert_eq!(&frame.payload[..], &[1, 2, 3]);
        assert_eq!(stream.state_code(), StreamStateCode::Open);
    }

    #[tokio::test]
    async fn test_write_fragments_large_buffer() {
        let (sink, mut frames) = test_sink();
        let stream = Stream::new(1, sink);

        let data = vec![0xA5u8; 200_000];
        stream.write(&data, false).await.unwrap();

        let mut reassembled = Vec::new();
        let expected_frames = data.len() / MAX_DATA_CHUNK + 1;
        for i in 0..expected_frames {
            let frame = frames.recv().await.unwrap();
            let parsed = DataFrame::from_frame(&frame).unwrap();
            assert!(parsed.payload.len() <= MAX_PAYLOAD);
            assert_eq!(parsed.end_data, i == expected_frames - 1);
            reassembled.extend_from_slice(&parsed.payload);
        }
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn test_write_end_stream_half_closes() {
        let (sink, mut frames) = test_sink();
        let stream = Stream::new(1, sink);

        stream.write(b"bye", true).await.unwrap();
        let parsed = DataFrame::from_frame(&frames.recv().await.unwrap()).unwrap();
        assert!(parsed.end_stream);
        assert_eq!(stream.state_code(), StreamStateCode::HalfClosedLocal);

        assert!(matches!(
            stream.write(b"more", false).await,
            Err(WireError::ClosedStream)
        ));
    }

    #[tokio::test]
    async fn test_read_delivers_dispatched_data() {
        let (sink, _frames) = test_sink();
        let stream = Stream::new(1, sink);

        stream
            .handle_data(DataFrame {
                stream_id: 1,
                end_data: true,
                end_stream: false,
                payload: Bytes::from_static(&[9, 8, 7]),
            })
            .await;

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[9, 8, 7]);
        assert_eq!(stream.state_code(), StreamStateCode::Open);
    }

    #[tokio::test]
    async fn test_remote_reset_fails_pending_read() {
        let (sink, _frames) = test_sink();
        let stream = Stream::new(1, sink);

        let reading = stream.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            reading.read(&mut buf).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        stream
            .handle_reset(ResetStreamFrame {
                stream_id: 1,
                error_code: ErrorCode::Cancel,
            })
            .await;

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(WireError::StreamReset(ErrorCode::Cancel))
        ));

        // Every later operation reports the same reset.
        let mut buf = [0u8; 4];
        assert!(matches!(
            stream.read(&mut buf).await,
            Err(WireError::StreamReset(ErrorCode::Cancel))
        ));
        assert!(matches!(
            stream.write(b"x", false).await,
            Err(WireError::StreamReset(ErrorCode::Cancel))
        ));
        assert!(matches!(
            stream.close_local().await,
            Err(WireError::StreamReset(ErrorCode::Cancel))
        ));
    }

    #[tokio::test]
    async fn test_local_cancel_records_error() {
        let (sink, mut frames) = test_sink();
        let stream = Stream::new(1, sink);

        stream.reset(ErrorCode::Cancel).await.unwrap();
        let parsed = ResetStreamFrame::from_frame(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(parsed.error_code, ErrorCode::Cancel);

        assert!(matches!(
            stream.write(b"x", false).await,
            Err(WireError::StreamCanceled(ErrorCode::Cancel))
        ));
    }

    #[tokio::test]
    async fn test_end_stream_then_read_returns_eof() {
        let (sink, _frames) = test_sink();
        let stream = Stream::new(1, sink);

        stream
            .handle_data(DataFrame {
                stream_id: 1,
                end_data: true,
                end_stream: true,
                payload: Bytes::from_static(b"tail"),
            })
            .await;

        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert_eq!(stream.state_code(), StreamStateCode::HalfClosedRemote);

        // Queue drained and the remote side half-closed: receive guard fails.
        assert!(matches!(
            stream.read(&mut buf).await,
            Err(WireError::ClosedStream)
        ));
    }

    #[tokio::test]
    async fn test_close_local_sends_terminal_data() {
        let (sink, mut frames) = test_sink();
        let stream = Stream::new(1, sink);

        stream.close_local().await.unwrap();
        let parsed = DataFrame::from_frame(&frames.recv().await.unwrap()).unwrap();
        assert!(parsed.end_stream);
        assert!(parsed.end_data);
        assert!(parsed.payload.is_empty());
        assert_eq!(stream.state_code(), StreamStateCode::HalfClosedLocal);
    }
}

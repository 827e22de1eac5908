//! Backpressured byte queue between the frame dispatcher and one consumer.

use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex, Notify};

/// Queue capacity in chunks. A full queue blocks the frame dispatcher,
/// propagating TCP backpressure to the peer.
pub const BLOCK_QUEUE_CAPACITY: usize = 128;

struct ReadState {
    rx: mpsc::Receiver<Bytes>,
    buf: Bytes,
}

/// A bounded queue of opaque byte blocks feeding a single consumer.
///
/// Producers enqueue whole blocks; the consumer reads arbitrary spans.
/// Partial reads are legal. Once closed, enqueues are dropped and readers
/// observe end-of-stream after draining any block already in hand.
pub struct BlockReader {
    tx: mpsc::Sender<Bytes>,
    state: Mutex<ReadState>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl BlockReader {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(BLOCK_QUEUE_CAPACITY);
        Self {
            tx,
            state: Mutex::new(ReadState {
                rx,
                buf: Bytes::new(),
            }),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    /// Appends a block. Empty blocks and blocks arriving after close are
    /// dropped. Suspends while the queue is at capacity.
    pub async fn enqueue(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }

        let closed = self.close_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();

        if self.closed.load(Ordering::Acquire) {
            return;
        }

        tokio::select! {
            result = self.tx.send(data) => {
                let _ = result;
            }
            _ = &mut closed => {}
        }
    }

    /// Non-blocking read.
    ///
    /// Returns `Some(n)` when bytes were copied, `Some(0)` at end-of-stream,
    /// and `None` when nothing is buffered but the queue is still open.
    pub async fn try_read(&self, into: &mut [u8]) -> Option<usize> {
        let mut state = self.state.lock().await;
        if state.buf.is_empty() {
            if self.closed.load(Ordering::Acquire) {
                return Some(0);
            }
            match state.rx.try_recv() {
                Ok(block) => state.buf = block,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(0),
            }
        }
        Some(copy_from(&mut state.buf, into))
    }

    /// Blocking read: suspends until data arrives or the queue closes.
    ///
    /// Returns 0 at end-of-stream.
    pub async fn read(&self, into: &mut [u8]) -> usize {
        let mut state = self.state.lock().await;
        if state.buf.is_empty() {
            let closed = self.close_notify.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return 0;
            }

            tokio::select! {
                block = state.rx.recv() => match block {
                    Some(block) => state.buf = block,
                    None => return 0,
                },
                _ = &mut closed => return 0,
            }
        }
        copy_from(&mut state.buf, into)
    }

    /// Closes the queue, waking blocked readers and producers. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for BlockReader {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_from(buf: &mut Bytes, into: &mut [u8]) -> usize {
    let n = buf.len().min(into.len());
    into[..n].copy_from_slice(&buf[..n]);
    buf.advance(n);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_read_after_enqueue() {
        let reader = BlockReader::new();
        reader.enqueue(Bytes::from_static(b"hello")).await;

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await;
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_partial_reads() {
        let reader = BlockReader::new();
        reader.enqueue(Bytes::from_static(b"abcdef")).await;

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await, 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).await, 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[tokio::test]
    async fn test_try_read_empty_open_queue() {
        let reader = BlockReader::new();
        let mut buf = [0u8; 4];
        assert_eq!(reader.try_read(&mut buf).await, None);
    }

    #[tokio::test]
    async fn test_try_read_after_close() {
        let reader = BlockReader::new();
        reader.close();
        let mut buf = [0u8; 4];
        assert_eq!(reader.try_read(&mut buf).await, Some(0));
    }

    #[tokio::test]
    async fn test_blocked_read_woken_by_enqueue() {
        let reader = Arc::new(BlockReader::new());
        let consumer = reader.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = consumer.read(&mut buf).await;
            buf[..n].to_vec()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        reader.enqueue(Bytes::from_static(b"wake")).await;
        assert_eq!(task.await.unwrap(), b"wake");
    }

    #[tokio::test]
    async fn test_blocked_read_woken_by_close() {
        let reader = Arc::new(BlockReader::new());
        let consumer = reader.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            consumer.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        reader.close();
        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_dropped() {
        let reader = BlockReader::new();
        reader.close();
        reader.enqueue(Bytes::from_static(b"late")).await;

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let reader = BlockReader::new();
        reader.close();
        reader.close();
        assert!(reader.is_closed());
    }

    #[tokio::test]
    async fn test_full_queue_enqueue_unblocked_by_close() {
        let reader = Arc::new(BlockReader::new());
        for _ in 0..BLOCK_QUEUE_CAPACITY {
            reader.enqueue(Bytes::from_static(b"x")).await;
        }

        let producer = reader.clone();
        let task = tokio::spawn(async move {
            producer.enqueue(Bytes::from_static(b"overflow")).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        reader.close();
        task.await.unwrap();
    }
}

//! Incremental message decoding.
//!
//! Stream payloads carry no per-message length prefix; the envelope is
//! self-describing. The decoder buffers incoming bytes and re-attempts a
//! parse until one complete message is available, treating a truncated
//! parse as "feed me more".

use crate::error::RpcError;
use crate::message::Message;
use arf_proto::DecodeError;
use bytes::{Buf, BytesMut};
use std::io::Cursor;

/// Buffering decoder turning stream bytes into envelope messages.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buffer: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Appends raw stream bytes to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// Returns `Ok(None)` when the buffered bytes form only a prefix of a
    /// message. Malformed input fails permanently.
    pub fn try_next(&mut self) -> Result<Option<Message>, RpcError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buffer[..]);
        match Message::decode(&mut cursor) {
            Ok(message) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                Ok(Some(message))
            }
            Err(RpcError::Decode(DecodeError::UnexpectedEof)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Request, Response};
    use arf_proto::Value;

    #[test]
    fn test_decode_single_message() {
        let msg = Message::Request(Request::new("svc", "method"));
        let encoded = msg.wrap();

        let mut decoder = MessageDecoder::new();
        decoder.extend(&encoded);

        assert_eq!(decoder.try_next().unwrap(), Some(msg));
        assert_eq!(decoder.try_next().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_then_complete() {
        let msg = Message::Response(Response::ok(vec![Value::from("payload")]));
        let encoded = msg.wrap();

        let mut decoder = MessageDecoder::new();
        decoder.extend(&encoded[..5]);
        assert_eq!(decoder.try_next().unwrap(), None);

        decoder.extend(&encoded[5..]);
        assert_eq!(decoder.try_next().unwrap(), Some(msg));
    }

    #[test]
    fn test_multiple_messages_in_buffer() {
        let first = Message::StartStream;
        let second = Message::StreamItem(crate::message::StreamItem {
            value: Value::from(7u8),
        });

        let mut decoder = MessageDecoder::new();
        decoder.extend(&first.wrap());
        decoder.extend(&second.wrap());

        assert_eq!(decoder.try_next().unwrap(), Some(first));
        assert_eq!(decoder.try_next().unwrap(), Some(second));
        assert_eq!(decoder.try_next().unwrap(), None);
    }

    #[test]
    fn test_malformed_kind_fails() {
        let mut decoder = MessageDecoder::new();
        decoder.extend(&[0x7F]);
        assert!(matches!(
            decoder.try_next(),
            Err(RpcError::InvalidKind(0x7F))
        ));
    }
}

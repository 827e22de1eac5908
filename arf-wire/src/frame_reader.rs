//! Async frame reading.

use crate::error::WireError;
use crate::frame::{Frame, FrameKind, FRAME_HEADER_SIZE, MAGIC};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads whole frames from a byte stream.
///
/// Payloads come back as read off the wire; decompression is the caller's
/// concern since the negotiated method lives with the connection.
pub struct FrameReader<R> {
    r: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(r: R) -> Self {
        Self { r }
    }

    /// Reads the next frame, validating magic and kind.
    pub async fn read(&mut self) -> Result<Frame, WireError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.r.read_exact(&mut header).await?;

        if header[0..3] != MAGIC {
            return Err(WireError::MagicMismatch);
        }

        let stream_id = u32::from_be_bytes(header[3..7].try_into().unwrap());
        let kind = FrameKind::from_byte(header[7]).ok_or(WireError::UnknownFrameKind(header[7]))?;
        let flags = header[8];
        let length = u16::from_be_bytes(header[9..11].try_into().unwrap()) as usize;

        let payload = if length == 0 {
            Bytes::new()
        } else {
            let mut buf = vec![0u8; length];
            self.r.read_exact(&mut buf).await?;
            Bytes::from(buf)
        };

        Ok(Frame {
            stream_id,
            kind,
            flags,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::frame::PingFrame;

    #[tokio::test]
    async fn test_read_single_frame() {
        let ping = PingFrame {
            ack: false,
            payload: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
        };
        let encoded = ping
            .clone()
            .into_frame()
            .encode(CompressionMethod::None)
            .unwrap();

        let mut reader = FrameReader::new(&encoded[..]);
        let frame = reader.read().await.unwrap();
        assert_eq!(PingFrame::from_frame(&frame).unwrap(), ping);
    }

    #[tokio::test]
    async fn test_magic_mismatch() {
        let mut bad = vec![0u8; FRAME_HEADER_SIZE];
        bad[0..3].copy_from_slice(b"bad");
        let mut reader = FrameReader::new(&bad[..]);
        assert!(matches!(reader.read().await, Err(WireError::MagicMismatch)));
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let mut bad = vec![0u8; FRAME_HEADER_SIZE];
        bad[0..3].copy_from_slice(&MAGIC);
        bad[7] = 0x2A;
        let mut reader = FrameReader::new(&bad[..]);
        assert!(matches!(
            reader.read().await,
            Err(WireError::UnknownFrameKind(0x2A))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let frame = Frame {
            stream_id: 1,
            kind: FrameKind::Data,
            flags: 0,
            payload: Bytes::from_static(b"full payload"),
        };
        let encoded = frame.encode(CompressionMethod::None).unwrap();
        let truncated = &encoded[..encoded.len() - 4];

        let mut reader = FrameReader::new(truncated);
        assert!(matches!(reader.read().await, Err(WireError::Io(_))));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_both_compressions() {
        for method in [CompressionMethod::None, CompressionMethod::Deflate] {
            let frame = Frame {
                stream_id: 12,
                kind: FrameKind::Data,
                flags: 0x02,
                payload: Bytes::from(vec![0x77u8; 2048]),
            };
            let encoded = frame.encode(method).unwrap();

            let mut reader = FrameReader::new(&encoded[..]);
            let mut decoded = reader.read().await.unwrap();
            decoded.decompress(method).unwrap();
            assert_eq!(decoded, frame);
        }
    }
}

//! Per-frame payload compression.
//!
//! Negotiated once during the handshake and sticky for the connection
//! lifetime. Handshake frames themselves always use `None`.

use crate::error::WireError;
use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Payload compression applied to each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    #[default]
    None,
    Deflate,
}

impl CompressionMethod {
    /// Compresses a payload before the frame length is computed.
    pub fn compress(&self, payload: &Bytes) -> Bytes {
        match self {
            CompressionMethod::None => payload.clone(),
            CompressionMethod::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
                // Writing into a Vec cannot fail.
                encoder.write_all(payload).unwrap();
                Bytes::from(encoder.finish().unwrap())
            }
        }
    }

    /// Decompresses a payload after the frame has been read.
    pub fn decompress(&self, payload: &Bytes) -> Result<Bytes, WireError> {
        match self {
            CompressionMethod::None => Ok(payload.clone()),
            CompressionMethod::Deflate => {
                let mut decoder = DeflateDecoder::new(&payload[..]);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| WireError::Compression(e.to_string()))?;
                Ok(Bytes::from(out))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_identity() {
        let payload = Bytes::from_static(b"identity");
        let compressed = CompressionMethod::None.compress(&payload);
        assert_eq!(compressed, payload);
        assert_eq!(
            CompressionMethod::None.decompress(&compressed).unwrap(),
            payload
        );
    }

    #[test]
    fn test_deflate_roundtrip() {
        let payload = Bytes::from(vec![0x42u8; 4096]);
        let compressed = CompressionMethod::Deflate.compress(&payload);
        assert!(compressed.len() < payload.len());

        let decompressed = CompressionMethod::Deflate.decompress(&compressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn test_deflate_rejects_garbage() {
        let garbage = Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]);
        // Deflate streams this short cannot be terminated correctly.
        let result = CompressionMethod::Deflate.decompress(&garbage);
        assert!(matches!(result, Err(WireError::Compression(_))));
    }
}

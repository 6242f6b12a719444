//! Optional compression of history batch payloads.
//!
//! A size optimization only: when the `compression` feature is on and
//! batch metadata is enabled, the Redis store attaches a compressed copy of
//! each history batch to its `gps:metadata:batch:<id>` record. Nothing in
//! the pipeline reads the blob back; correctness never depends on it.
//!
//! Uses zstd with magic-bytes detection so a future reader can tell
//! compressed blobs from plain JSON.
//!
//! # Feature Flag
//!
//! ```toml
//! [dependencies]
//! gps-gateway = { version = "0.1", features = ["compression"] }
//! ```

#[cfg(feature = "compression")]
use crate::position::Position;

/// Zstd magic bytes (little-endian): 0xFD2FB528
#[cfg(feature = "compression")]
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
#[cfg(feature = "compression")]
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    #[error("payload encoding failed: {0}")]
    EncodeFailed(String),
}

/// Compress a batch of positions to an opaque blob.
#[cfg(feature = "compression")]
pub fn compress_positions(positions: &[Position]) -> Result<Vec<u8>, CompressionError> {
    let json =
        serde_json::to_vec(positions).map_err(|e| CompressionError::EncodeFailed(e.to_string()))?;
    zstd::encode_all(json.as_slice(), DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

/// Decompress a blob produced by [`compress_positions`]. Data without the
/// zstd magic bytes is treated as plain JSON.
#[cfg(feature = "compression")]
pub fn decompress_positions(data: &[u8]) -> Result<Vec<Position>, CompressionError> {
    let json = if data.starts_with(&ZSTD_MAGIC) {
        zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))?
    } else {
        data.to_vec()
    };
    serde_json::from_slice(&json).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
}

#[cfg(all(test, feature = "compression"))]
mod tests {
    use super::*;
    use chrono::Utc;

    fn positions() -> Vec<Position> {
        (0..50)
            .map(|i| {
                Position::new(format!("dev-{}", i % 5), 40.0 + i as f64 * 0.001, -74.0, Utc::now())
                    .with_metadata("speed", 30.0 + i as f64)
            })
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let original = positions();
        let blob = compress_positions(&original).unwrap();
        assert!(blob.starts_with(&ZSTD_MAGIC));
        let restored = decompress_positions(&blob).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_compression_shrinks_repetitive_payloads() {
        let original = positions();
        let json = serde_json::to_vec(&original).unwrap();
        let blob = compress_positions(&original).unwrap();
        assert!(blob.len() < json.len());
    }

    #[test]
    fn test_plain_json_passthrough() {
        let original = positions();
        let json = serde_json::to_vec(&original).unwrap();
        let restored = decompress_positions(&json).unwrap();
        assert_eq!(restored, original);
    }
}

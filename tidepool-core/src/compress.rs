//! Optional body compression for framed messages.
//!
//! A [`Compressor`] shrinks message bodies before framing and restores
//! them after. The advisory [`should_compress`](Compressor::should_compress)
//! predicate lets an implementation skip bodies that are not worth the
//! CPU (tiny payloads, already-compressed data).

use thiserror::Error;

/// Errors from compressing or decompressing a message body.
#[derive(Debug, Clone, Error)]
pub enum CompressError {
    /// Compressing the body failed.
    #[error("compress failed: {0}")]
    Compress(String),

    /// Decompressing the body failed (corrupt or truncated input).
    #[error("decompress failed: {0}")]
    Decompress(String),
}

/// Pluggable body compression.
///
/// Implementations must be lossless: `decompress(compress(b)) == b` for
/// every body `b` the predicate admits.
pub trait Compressor {
    /// Compress a message body.
    fn compress(&self, body: &[u8]) -> Result<Vec<u8>, CompressError>;

    /// Decompress a message body.
    fn decompress(&self, body: &[u8]) -> Result<Vec<u8>, CompressError>;

    /// Advisory predicate: is this body worth compressing?
    ///
    /// Frames whose body is rejected here are sent uncompressed with the
    /// compression flag clear. Decoders never consult the predicate.
    fn should_compress(&self, body: &[u8]) -> bool;
}

/// Zstandard compressor.
///
/// Bodies shorter than `min_size` are passed through uncompressed; small
/// payloads typically grow under compression once the zstd frame header
/// is added.
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    /// Compression level (1-22, zstd's scale).
    pub level: i32,
    /// Minimum body size the advisory predicate admits.
    pub min_size: usize,
}

impl ZstdCompressor {
    /// Create a compressor with the given level and a 512-byte floor.
    pub fn new(level: i32) -> Self {
        Self {
            level,
            min_size: 512,
        }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, body: &[u8]) -> Result<Vec<u8>, CompressError> {
        zstd::bulk::compress(body, self.level).map_err(|e| CompressError::Compress(e.to_string()))
    }

    fn decompress(&self, body: &[u8]) -> Result<Vec<u8>, CompressError> {
        zstd::stream::decode_all(body).map_err(|e| CompressError::Decompress(e.to_string()))
    }

    fn should_compress(&self, body: &[u8]) -> bool {
        body.len() >= self.min_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_roundtrip() {
        let compressor = ZstdCompressor::default();
        let body = b"hello hello hello hello hello hello hello".repeat(32);

        let compressed = compressor.compress(&body).expect("compress");
        assert!(compressed.len() < body.len());

        let restored = compressor.decompress(&compressed).expect("decompress");
        assert_eq!(restored, body);
    }

    #[test]
    fn predicate_rejects_small_bodies() {
        let compressor = ZstdCompressor::default();
        assert!(!compressor.should_compress(b"tiny"));
        assert!(compressor.should_compress(&vec![0u8; 4096]));
    }

    #[test]
    fn decompress_rejects_garbage() {
        let compressor = ZstdCompressor::default();
        let result = compressor.decompress(b"definitely not a zstd frame");
        assert!(matches!(result, Err(CompressError::Decompress(_))));
    }
}

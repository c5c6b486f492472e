// src/storage/compressor.rs
//! zstd compression for checkpoint payloads

use crate::utils::errors::{FleetError, Result};
use tracing::trace;

/// Compressor using zstd
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: i32,
}

impl Compressor {
    /// Create a compressor. `level` must be a valid zstd level (1..=22).
    pub fn new(level: i32) -> Result<Self> {
        if !zstd::compression_level_range().contains(&level) || level < 1 {
            return Err(FleetError::ConfigError(format!(
                "invalid zstd compression level {}",
                level
            )));
        }
        Ok(Self { level })
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = zstd::encode_all(data, self.level)
            .map_err(|e| FleetError::CompressionFailed(format!("Compression error: {}", e)))?;

        trace!(
            "Compressed {} bytes -> {} bytes at level {}",
            data.len(),
            compressed.len(),
            self.level
        );
        Ok(compressed)
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data)
            .map_err(|e| FleetError::CompressionFailed(format!("Decompression error: {}", e)))
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self { level: 3 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_sized_payload() {
        let compressor = Compressor::default();
        let payload = r#"{"task_id":"t1","step":4,"state":{"files":["a.rs","b.rs"]}}"#.repeat(200);

        let compressed = compressor.compress(payload.as_bytes()).unwrap();
        assert!(compressed.len() * 5 < payload.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), payload.as_bytes());
    }

    #[test]
    fn test_invalid_level() {
        assert!(Compressor::new(0).is_err());
        assert!(Compressor::new(99).is_err());
        assert_eq!(Compressor::new(19).unwrap().level(), 19);
    }

    #[test]
    fn test_garbage_input_rejected() {
        assert!(Compressor::default().decompress(b"not zstd").is_err());
    }
}

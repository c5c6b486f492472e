// src/storage/mod.rs
//! Durable task status and checkpoint storage
//!
//! SQLite holds one row per task in each of two tables; checkpoint payloads
//! are zstd-compressed JSON.

pub mod compressor;
pub mod sqlite;

use crate::utils::errors::{FleetError, Result};
use serde::{Deserialize, Serialize};

pub use compressor::Compressor;
pub use sqlite::SqliteStore;

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file, or `:memory:`
    pub db_path: String,

    /// zstd level for checkpoint payloads (default: 3)
    pub compression_level: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "fleet.db".to_string(),
            compression_level: 3,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.db_path.is_empty() {
            return Err(FleetError::ConfigError("storage.db_path cannot be empty".to_string()));
        }
        Compressor::new(self.compression_level).map(|_| ())
    }
}

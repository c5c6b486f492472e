// src/storage/sqlite.rs
//! SQLite-backed status and checkpoint store

use crate::lifecycle::checkpoint::{Checkpoint, CheckpointStore};
use crate::lifecycle::status::{StatusStore, TaskStatus};
use crate::storage::compressor::Compressor;
use crate::storage::StorageConfig;
use crate::utils::errors::{FleetError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable store for task status and checkpoints
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    compressor: Compressor,
}

impl SqliteStore {
    /// Open (or create) the database at `config.db_path`
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        let compressor = Compressor::new(config.compression_level)?;

        if config.db_path != ":memory:" {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        FleetError::StorageFailed(format!("Failed to create directory: {}", e))
                    })?;
                }
            }
        }

        let conn = Connection::open(&config.db_path).map_err(|e| {
            FleetError::StorageFailed(format!("Failed to open database: {}", e))
        })?;

        let store = Self {
            db: Arc::new(Mutex::new(conn)),
            compressor,
        };
        store.init_schema().await?;

        info!("Fleet storage initialized at {}", config.db_path);
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS task_status (
                task_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                task_id TEXT PRIMARY KEY,
                step INTEGER NOT NULL,
                payload BLOB NOT NULL,
                raw_size INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| FleetError::StorageFailed(format!("Schema creation failed: {}", e)))?;

        Ok(())
    }

    /// Number of stored checkpoints
    pub async fn checkpoint_count(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn get(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let db = self.db.lock().await;
        let status: Option<String> = db
            .query_row(
                "SELECT status FROM task_status WHERE task_id = ?",
                params![task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| FleetError::StatusStoreFailed(format!("Status read failed: {}", e)))?;

        status
            .map(|s| s.parse::<TaskStatus>().map_err(FleetError::StatusStoreFailed))
            .transpose()
    }

    async fn set(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO task_status (task_id, status, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(task_id) DO UPDATE SET status = ?2, updated_at = ?3
            "#,
            params![task_id, status.as_str(), chrono::Utc::now().timestamp()],
        )
        .map_err(|e| FleetError::StatusStoreFailed(format!("Status write failed: {}", e)))?;

        debug!("Task {} status -> {}", task_id, status);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn put(&self, key: &str, checkpoint: &Checkpoint) -> Result<()> {
        let raw = serde_json::to_vec(checkpoint)?;
        let payload = self.compressor.compress(&raw)?;

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO checkpoints (task_id, step, payload, raw_size, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(task_id) DO UPDATE SET
                step = ?2, payload = ?3, raw_size = ?4, created_at = ?5
            "#,
            params![
                key,
                checkpoint.step as i64,
                payload,
                raw.len() as i64,
                checkpoint.created_at.timestamp(),
            ],
        )
        .map_err(|e| FleetError::CheckpointFailed(format!("Checkpoint write failed: {}", e)))?;

        debug!(
            "Stored checkpoint {} step {} ({} -> {} bytes)",
            key,
            checkpoint.step,
            raw.len(),
            payload.len()
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Checkpoint>> {
        let payload: Option<Vec<u8>> = {
            let db = self.db.lock().await;
            db.query_row(
                "SELECT payload FROM checkpoints WHERE task_id = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| FleetError::CheckpointFailed(format!("Checkpoint read failed: {}", e)))?
        };

        match payload {
            Some(payload) => {
                let raw = self.compressor.decompress(&payload)?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute("DELETE FROM checkpoints WHERE task_id = ?", params![key])
            .map_err(|e| {
                FleetError::CheckpointFailed(format!("Checkpoint delete failed: {}", e))
            })?;
        Ok(())
    }
}

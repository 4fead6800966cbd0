//! SQLite checkpoint store

use super::{format_timestamp, parse_timestamp, CheckpointStore};
use crate::Result;
use agent_rpc::IntegrationId;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CHECKPOINT_DB_NAME: &str = "checkpoints.db";

/// Checkpoints persisted in `<root>/checkpoints.db`
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteCheckpointStore {
    /// Open the store under the agent root directory
    pub fn open_in(root: &Path) -> Result<Self> {
        Self::open(root.join(CHECKPOINT_DB_NAME))
    }

    /// Open or create a checkpoint database
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::debug!(path = %path.display(), "Opening checkpoint database");

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self {
            conn: Mutex::new(conn),
            path,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<()> {
        self.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                integration TEXT NOT NULL,
                object_type TEXT NOT NULL,
                last_processed TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (integration, object_type)
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get(&self, id: &IntegrationId, object_type: &str) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .lock()
            .query_row(
                "SELECT last_processed FROM checkpoints WHERE integration = ? AND object_type = ?",
                params![id.to_string(), object_type],
                |row| row.get(0),
            )
            .optional()?;

        value
            .map(|v| parse_timestamp(id, object_type, &v))
            .transpose()
    }

    fn set(&self, id: &IntegrationId, object_type: &str, at: DateTime<Utc>) -> Result<()> {
        self.lock().execute(
            r#"
            INSERT INTO checkpoints (integration, object_type, last_processed, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(integration, object_type)
            DO UPDATE SET last_processed = excluded.last_processed, updated_at = excluded.updated_at
            "#,
            params![
                id.to_string(),
                object_type,
                format_timestamp(at),
                format_timestamp(Utc::now()),
            ],
        )?;

        tracing::debug!(integration = %id, object_type, last_processed = %at, "Checkpoint stored");
        Ok(())
    }

    fn clear(&self, id: &IntegrationId, object_type: &str) -> Result<()> {
        let removed = self.lock().execute(
            "DELETE FROM checkpoints WHERE integration = ? AND object_type = ?",
            params![id.to_string(), object_type],
        )?;

        tracing::debug!(integration = %id, object_type, removed, "Checkpoint cleared");
        Ok(())
    }
}

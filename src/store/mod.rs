use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Correlation between a source message and one message it was mirrored to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRecord {
    pub original_id: i64,
    pub original_channel: i64,
    pub mirror_id: i64,
    pub mirror_channel: i64,
}

/// Durable record of mirrored messages, used to find the copies of a message when it is edited
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn insert(&self, record: &MappingRecord) -> Result<()>;

    /// Every known copy of a source message, oldest first. Empty if it was never mirrored.
    async fn get_messages_to_edit(
        &self,
        original_id: i64,
        original_channel: i64,
    ) -> Result<Vec<MappingRecord>>;
}

/// SQLite-backed mapping store.
/// The connection sits behind an async mutex, so each record is written in one locked step.
#[derive(Clone)]
pub struct SqliteMappingStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMappingStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Mapping store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS mirror_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_id INTEGER NOT NULL,
                original_channel INTEGER NOT NULL,
                mirror_id INTEGER NOT NULL,
                mirror_channel INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_mirror_messages_original
                ON mirror_messages(original_id, original_channel);
            ",
        )
        .context("Failed to run mapping store migrations")?;
        Ok(())
    }

    /// Total number of stored records
    pub async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT count(*) FROM mirror_messages", [], |row| row.get(0))
            .context("Failed to count mapping records")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn insert(&self, record: &MappingRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO mirror_messages (original_id, original_channel, mirror_id, mirror_channel)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                record.original_id,
                record.original_channel,
                record.mirror_id,
                record.mirror_channel,
            ],
        )
        .context("Failed to insert mapping record")?;
        Ok(())
    }

    async fn get_messages_to_edit(
        &self,
        original_id: i64,
        original_channel: i64,
    ) -> Result<Vec<MappingRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT original_id, original_channel, mirror_id, mirror_channel
             FROM mirror_messages
             WHERE original_id = ?1 AND original_channel = ?2
             ORDER BY id ASC",
        )?;

        let records = stmt
            .query_map(rusqlite::params![original_id, original_channel], |row| {
                Ok(MappingRecord {
                    original_id: row.get(0)?,
                    original_channel: row.get(1)?,
                    mirror_id: row.get(2)?,
                    mirror_channel: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load mapping records")?;

        Ok(records)
    }
}

//! SQLite-backed durable key-value store.
//!
//! Persists local records and the sync queue so both survive restarts and
//! network loss.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use shopsync_common::{Error, Result};

use crate::backend::{KvBackend, WriteBatch, WriteOp};

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Durable backend using a single SQLite table.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(storage_err)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(storage_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            "#,
        )
        .map_err(storage_err)?;

        info!("Local database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))
    }
}

fn decode(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| Error::Storage(format!("Corrupt value: {}", e)))
}

impl KvBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;

        raw.as_deref().map(decode).transpose()
    }

    fn scan(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv WHERE namespace = ?1 ORDER BY key")
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([namespace], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(storage_err)?;

        let mut result = Vec::new();
        for row in rows {
            let (key, raw) = row.map_err(storage_err)?;
            result.push((key, decode(&raw)?));
        }
        Ok(result)
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        let count = batch.len();

        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    let raw = serde_json::to_string(&value)?;
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)",
                        params![namespace, key, raw],
                    )
                    .map_err(storage_err)?;
                }
                WriteOp::Delete { namespace, key } => {
                    tx.execute(
                        "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                        params![namespace, key],
                    )
                    .map_err(storage_err)?;
                }
            }
        }

        tx.commit().map_err(storage_err)?;
        debug!("Committed batch of {} writes", count);
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        info!("Clearing namespace {}", namespace);
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE namespace = ?1", [namespace])
            .map_err(storage_err)?;
        Ok(())
    }
}

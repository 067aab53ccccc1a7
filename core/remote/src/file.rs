//! JSON-file remote system.
//!
//! A single-process stand-in for a hosted backend: rows live in memory and
//! are written to `remote.json` under the configured root after every
//! successful mutation. Used by the CLI so separate invocations share the
//! same "server".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use shopsync_common::{EntityType, Error, Fields, Result};

use crate::memory::MemoryRemote;
use crate::provider::{RemoteRecord, RemoteSystem};

const FILE_NAME: &str = "remote.json";

/// Remote system persisted to a JSON file.
pub struct FileRemote {
    inner: MemoryRemote,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRemote {
    /// Open (or create) a file remote rooted at `root`.
    ///
    /// # Errors
    /// - Root directory cannot be created
    /// - Existing file is not a valid snapshot
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let path = root.join(FILE_NAME);

        let inner = MemoryRemote::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let snapshot: BTreeMap<String, Vec<RemoteRecord>> = serde_json::from_str(&raw)?;
            inner.restore(snapshot)?;
            info!("Loaded file remote from {}", path.display());
        }

        Ok(Self {
            inner,
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The in-memory tables, for failure simulation.
    pub fn inner(&self) -> &MemoryRemote {
        &self.inner
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.inner.snapshot()?;
        let raw = serde_json::to_string_pretty(&snapshot)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Persisted file remote to {}", self.path.display());
        Ok(())
    }

    /// Persist after a write, including writes whose acknowledgement failed.
    async fn settle<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.persist().await?,
            Err(e) if e.is_transient() => self.persist().await?,
            Err(_) => {}
        }
        result
    }
}

#[async_trait]
impl RemoteSystem for FileRemote {
    fn name(&self) -> &str {
        "file"
    }

    async fn create(
        &self,
        entity: EntityType,
        fields: Fields,
        idempotency_key: Option<&str>,
    ) -> Result<RemoteRecord> {
        let result = self.inner.create(entity, fields, idempotency_key).await;
        self.settle(result).await
    }

    async fn update(
        &self,
        entity: EntityType,
        remote_id: &str,
        patch: Fields,
        expected_version: Option<DateTime<Utc>>,
    ) -> Result<RemoteRecord> {
        let result = self
            .inner
            .update(entity, remote_id, patch, expected_version)
            .await;
        self.settle(result).await
    }

    async fn delete(&self, entity: EntityType, remote_id: &str) -> Result<()> {
        let result = self.inner.delete(entity, remote_id).await;
        self.settle(result).await
    }

    async fn get(&self, entity: EntityType, remote_id: &str) -> Result<Option<RemoteRecord>> {
        self.inner.get(entity, remote_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        entity: EntityType,
        key: &str,
    ) -> Result<Option<RemoteRecord>> {
        self.inner.find_by_idempotency_key(entity, key).await
    }

    async fn list(&self, entity: EntityType) -> Result<Vec<RemoteRecord>> {
        self.inner.list(entity).await
    }

    async fn ping(&self) -> Result<()> {
        if !self.inner.is_online() {
            return Err(Error::Network("Remote unreachable".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let temp = TempDir::new().unwrap();

        let created = {
            let remote = FileRemote::open(temp.path()).unwrap();
            remote
                .create(
                    EntityType::Customer,
                    json!({"name": "Ana", "debt": 100}).as_object().cloned().unwrap(),
                    Some("k1"),
                )
                .await
                .unwrap()
        };

        let remote = FileRemote::open(temp.path()).unwrap();
        let found = remote
            .find_by_idempotency_key(EntityType::Customer, "k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, created);
    }

    #[tokio::test]
    async fn test_delete_persists() {
        let temp = TempDir::new().unwrap();
        let remote = FileRemote::open(temp.path()).unwrap();
        let created = remote
            .create(EntityType::Sale, Fields::new(), None)
            .await
            .unwrap();
        remote.delete(EntityType::Sale, &created.remote_id).await.unwrap();

        let reopened = FileRemote::open(temp.path()).unwrap();
        assert!(reopened.list(EntityType::Sale).await.unwrap().is_empty());
    }
}

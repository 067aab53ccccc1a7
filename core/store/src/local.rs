//! Local record store.
//!
//! Typed record collections on top of a [`KvBackend`]. The store knows
//! nothing about synchronization; callers pair every mutation with an
//! enqueue, usually by staging both into one [`WriteBatch`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use shopsync_common::{EntityType, Error, Fields, LocalRecord, RecordId, Result};

use crate::backend::{KvBackend, WriteBatch};
use crate::normalize::FieldNormalizer;

/// Remote identity of a record, kept even after the local copy is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBinding {
    pub remote_id: String,
    pub remote_version: Option<DateTime<Utc>>,
}

/// Persistent store of [`LocalRecord`] collections.
pub struct LocalStore {
    backend: Arc<dyn KvBackend>,
    normalizer: FieldNormalizer,
}

fn records_ns(entity: EntityType) -> String {
    format!("records/{}", entity.collection())
}

fn bindings_ns(entity: EntityType) -> String {
    format!("remote_ids/{}", entity.collection())
}

impl LocalStore {
    /// Create a store over a backend.
    pub fn new(backend: Arc<dyn KvBackend>, normalizer: FieldNormalizer) -> Self {
        Self {
            backend,
            normalizer,
        }
    }

    /// The backend shared with the sync queue.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// The normalizer applied at this store's boundary.
    pub fn normalizer(&self) -> &FieldNormalizer {
        &self.normalizer
    }

    /// Upsert a record by id and return the stored copy.
    pub fn put(&self, entity: EntityType, record: LocalRecord) -> Result<LocalRecord> {
        let mut batch = WriteBatch::new();
        let stored = self.stage_put(&mut batch, entity, record)?;
        self.backend.commit(batch)?;
        Ok(stored)
    }

    /// Stage an upsert without committing. Fields are canonicalized and
    /// `updated_at` is stamped.
    pub fn stage_put(
        &self,
        batch: &mut WriteBatch,
        entity: EntityType,
        mut record: LocalRecord,
    ) -> Result<LocalRecord> {
        record.fields = self.normalizer.to_canonical(&record.fields);
        record.updated_at = Utc::now();

        batch.put(&records_ns(entity), record.id.as_str(), &record)?;
        if let Some(remote_id) = &record.remote_id {
            let binding = RemoteBinding {
                remote_id: remote_id.clone(),
                remote_version: record.remote_version,
            };
            batch.put(&bindings_ns(entity), record.id.as_str(), &binding)?;
        }
        Ok(record)
    }

    /// Get one record.
    pub fn get(&self, entity: EntityType, id: &RecordId) -> Result<Option<LocalRecord>> {
        self.backend
            .get(&records_ns(entity), id.as_str())?
            .map(|value| serde_json::from_value(value).map_err(Error::from))
            .transpose()
    }

    /// Get a record that must exist.
    pub fn require(&self, entity: EntityType, id: &RecordId) -> Result<LocalRecord> {
        self.get(entity, id)?
            .ok_or_else(|| Error::NotFound(format!("{} {} not found locally", entity, id)))
    }

    /// Get the whole collection. Order is not guaranteed.
    pub fn list(&self, entity: EntityType) -> Result<Vec<LocalRecord>> {
        self.backend
            .scan(&records_ns(entity))?
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).map_err(Error::from))
            .collect()
    }

    /// Delete a record. Succeeds if absent.
    pub fn remove(&self, entity: EntityType, id: &RecordId) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.stage_remove(&mut batch, entity, id);
        self.backend.commit(batch)
    }

    /// Stage a delete. The remote binding is kept so a queued remote delete
    /// can still address the record.
    pub fn stage_remove(&self, batch: &mut WriteBatch, entity: EntityType, id: &RecordId) {
        batch.delete(&records_ns(entity), id.as_str());
    }

    /// Empty a collection. Remote bindings are kept.
    pub fn clear(&self, entity: EntityType) -> Result<()> {
        debug!("Clearing local collection {}", entity);
        self.backend.clear(&records_ns(entity))
    }

    /// Import a remote-shaped row as the local copy of `id`.
    pub fn put_remote(
        &self,
        entity: EntityType,
        id: RecordId,
        remote_id: String,
        remote_version: Option<DateTime<Utc>>,
        raw: &Fields,
    ) -> Result<LocalRecord> {
        let mut record = LocalRecord::new(id, self.normalizer.to_canonical(raw));
        record.remote_id = Some(remote_id);
        record.remote_version = remote_version;
        self.put(entity, record)
    }

    /// Remote binding of a record, if the remote ever confirmed it.
    pub fn binding(&self, entity: EntityType, id: &RecordId) -> Result<Option<RemoteBinding>> {
        self.backend
            .get(&bindings_ns(entity), id.as_str())?
            .map(|value| serde_json::from_value(value).map_err(Error::from))
            .transpose()
    }

    /// Remote identifier of a record, if known.
    pub fn remote_id_of(&self, entity: EntityType, id: &RecordId) -> Result<Option<String>> {
        Ok(self.binding(entity, id)?.map(|b| b.remote_id))
    }

    /// Stage recording a remote confirmation: the binding is always written,
    /// the local record (if still present) gets the remote id and version.
    pub fn stage_bind_remote(
        &self,
        batch: &mut WriteBatch,
        entity: EntityType,
        id: &RecordId,
        remote_id: &str,
        remote_version: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let binding = RemoteBinding {
            remote_id: remote_id.to_string(),
            remote_version,
        };
        batch.put(&bindings_ns(entity), id.as_str(), &binding)?;

        if let Some(mut record) = self.get(entity, id)? {
            record.remote_id = Some(remote_id.to_string());
            record.remote_version = remote_version;
            batch.put(&records_ns(entity), id.as_str(), &record)?;
        }
        Ok(())
    }

    /// Stage dropping the remote binding once the remote record is deleted.
    pub fn stage_unbind_remote(&self, batch: &mut WriteBatch, entity: EntityType, id: &RecordId) {
        batch.delete(&bindings_ns(entity), id.as_str());
    }

    /// Count records in a collection.
    pub fn count(&self, entity: EntityType) -> Result<usize> {
        Ok(self.backend.scan(&records_ns(entity))?.len())
    }
}

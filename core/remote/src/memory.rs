//! In-memory remote system for testing.
//!
//! Besides plain storage this adapter can simulate the failure modes the
//! sync engine has to survive: an unreachable backend, scripted errors,
//! a lost acknowledgement after a successful write, slow responses, and a
//! legacy schema that drops idempotency keys.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use shopsync_common::{ConflictSignal, EntityType, Error, Fields, Result};

use crate::provider::{domain_columns, RemoteRecord, RemoteSystem, CREATED_COLUMN};

/// Scripted failure consumed by the next mutating call.
#[derive(Debug)]
pub enum Fault {
    /// Fail without touching the data.
    Fail(Error),
    /// Apply the write, then report the error (lost acknowledgement).
    ApplyThenFail(Error),
}

#[derive(Default)]
struct Tables {
    rows: HashMap<EntityType, BTreeMap<String, RemoteRecord>>,
    faults: VecDeque<Fault>,
    last_version: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing version stamp.
    fn next_version(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let version = match self.last_version {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_version = Some(version);
        version
    }

    fn table(&mut self, entity: EntityType) -> &mut BTreeMap<String, RemoteRecord> {
        self.rows.entry(entity).or_default()
    }
}

/// In-memory remote system.
///
/// All data is lost on drop unless wrapped by [`crate::FileRemote`].
pub struct MemoryRemote {
    tables: Mutex<Tables>,
    online: AtomicBool,
    persist_keys: AtomicBool,
    create_calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    required: Mutex<HashMap<EntityType, HashSet<String>>>,
}

impl MemoryRemote {
    /// Create a new empty, reachable remote.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            online: AtomicBool::new(true),
            persist_keys: AtomicBool::new(true),
            create_calls: AtomicUsize::new(0),
            latency: Mutex::new(None),
            required: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::Storage("Memory remote lock poisoned".to_string()))
    }

    /// Make every call fail with a network error, or restore reachability.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Whether the remote currently answers.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Whether idempotency keys are stored with created rows.
    pub fn set_persist_idempotency_keys(&self, persist: bool) {
        self.persist_keys.store(persist, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    /// Reject created rows of `entity` that lack `column`.
    pub fn require_column(&self, entity: EntityType, column: impl Into<String>) {
        if let Ok(mut guard) = self.required.lock() {
            guard.entry(entity).or_default().insert(column.into());
        }
    }

    /// Queue a scripted failure for the next mutating call.
    pub fn push_fault(&self, fault: Fault) -> Result<()> {
        self.lock()?.faults.push_back(fault);
        Ok(())
    }

    /// Number of `create` calls received, including failed ones.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of one collection, ordered by remote id.
    pub fn rows(&self, entity: EntityType) -> Result<Vec<RemoteRecord>> {
        Ok(self
            .lock()?
            .rows
            .get(&entity)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Insert a row verbatim, bypassing validation and faults.
    pub fn insert_raw(&self, entity: EntityType, record: RemoteRecord) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.last_version.map_or(true, |v| v < record.updated_at) {
            tables.last_version = Some(record.updated_at);
        }
        tables.table(entity).insert(record.remote_id.clone(), record);
        Ok(())
    }

    /// Change a row out of band, as another device would.
    pub fn modify(
        &self,
        entity: EntityType,
        remote_id: &str,
        patch: Fields,
    ) -> Result<RemoteRecord> {
        let mut tables = self.lock()?;
        let version = tables.next_version();
        let row = tables
            .table(entity)
            .get_mut(remote_id)
            .ok_or_else(|| not_found(entity, remote_id))?;
        row.fields.extend(domain_columns(patch));
        row.updated_at = version;
        Ok(row.clone())
    }

    /// Every row of every collection.
    pub fn snapshot(&self) -> Result<BTreeMap<String, Vec<RemoteRecord>>> {
        let tables = self.lock()?;
        Ok(tables
            .rows
            .iter()
            .map(|(entity, rows)| {
                (entity.collection().to_string(), rows.values().cloned().collect())
            })
            .collect())
    }

    /// Replace all rows with a snapshot.
    pub fn restore(&self, snapshot: BTreeMap<String, Vec<RemoteRecord>>) -> Result<()> {
        let mut rows = HashMap::new();
        let mut last = None;
        for (collection, records) in snapshot {
            let entity: EntityType = collection.parse()?;
            let table: &mut BTreeMap<String, RemoteRecord> = rows.entry(entity).or_default();
            for record in records {
                if last.map_or(true, |v| v < record.updated_at) {
                    last = Some(record.updated_at);
                }
                table.insert(record.remote_id.clone(), record);
            }
        }

        let mut tables = self.lock()?;
        tables.rows = rows;
        tables.last_version = last;
        Ok(())
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.latency.lock().ok().and_then(|g| *g);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.is_online() {
            return Err(Error::Network("Remote unreachable".to_string()));
        }
        Ok(())
    }

    fn validate(&self, entity: EntityType, fields: &Fields) -> Result<()> {
        let required = self.required.lock().ok().and_then(|g| g.get(&entity).cloned());
        if let Some(columns) = required {
            for column in columns {
                if fields.get(&column).map_or(true, Value::is_null) {
                    return Err(Error::Validation(format!(
                        "{} requires column '{}'",
                        entity, column
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(entity: EntityType, remote_id: &str) -> Error {
    Error::NotFound(format!("{} {} not found remotely", entity, remote_id))
}

/// Apply `write` unless a scripted fault says otherwise.
fn with_fault<T>(tables: &mut Tables, write: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
    match tables.faults.pop_front() {
        Some(Fault::Fail(err)) => Err(err),
        Some(Fault::ApplyThenFail(err)) => {
            write(tables)?;
            Err(err)
        }
        None => write(tables),
    }
}

#[async_trait]
impl RemoteSystem for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(
        &self,
        entity: EntityType,
        fields: Fields,
        idempotency_key: Option<&str>,
    ) -> Result<RemoteRecord> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let mut fields = domain_columns(fields);
        self.validate(entity, &fields)?;

        let key = idempotency_key
            .filter(|_| self.persist_keys.load(Ordering::SeqCst))
            .map(str::to_string);

        let mut tables = self.lock()?;
        with_fault(&mut tables, |tables| {
            let version = tables.next_version();
            fields
                .entry(CREATED_COLUMN.to_string())
                .or_insert_with(|| Value::String(version.to_rfc3339()));

            let record = RemoteRecord {
                remote_id: Uuid::new_v4().to_string(),
                fields,
                idempotency_key: key,
                updated_at: version,
            };
            tables
                .table(entity)
                .insert(record.remote_id.clone(), record.clone());
            debug!("Created {} {}", entity, record.remote_id);
            Ok(record)
        })
    }

    async fn update(
        &self,
        entity: EntityType,
        remote_id: &str,
        patch: Fields,
        expected_version: Option<DateTime<Utc>>,
    ) -> Result<RemoteRecord> {
        self.enter().await?;
        let patch = domain_columns(patch);

        let mut tables = self.lock()?;
        with_fault(&mut tables, |tables| {
            let version = tables.next_version();
            let row = tables
                .table(entity)
                .get_mut(remote_id)
                .ok_or_else(|| not_found(entity, remote_id))?;

            if let Some(expected) = expected_version {
                if row.updated_at != expected {
                    return Err(Error::conflict(ConflictSignal {
                        entity,
                        remote_id: remote_id.to_string(),
                        remote_version: Some(row.updated_at),
                        remote: row.fields.clone(),
                    }));
                }
            }

            row.fields.extend(patch);
            row.updated_at = version;
            Ok(row.clone())
        })
    }

    async fn delete(&self, entity: EntityType, remote_id: &str) -> Result<()> {
        self.enter().await?;

        let mut tables = self.lock()?;
        with_fault(&mut tables, |tables| {
            tables
                .table(entity)
                .remove(remote_id)
                .map(|_| ())
                .ok_or_else(|| not_found(entity, remote_id))
        })
    }

    async fn get(&self, entity: EntityType, remote_id: &str) -> Result<Option<RemoteRecord>> {
        self.enter().await?;
        Ok(self
            .lock()?
            .rows
            .get(&entity)
            .and_then(|t| t.get(remote_id))
            .cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        entity: EntityType,
        key: &str,
    ) -> Result<Option<RemoteRecord>> {
        self.enter().await?;
        Ok(self.lock()?.rows.get(&entity).and_then(|t| {
            t.values()
                .find(|r| r.idempotency_key.as_deref() == Some(key))
                .cloned()
        }))
    }

    async fn list(&self, entity: EntityType) -> Result<Vec<RemoteRecord>> {
        self.enter().await?;
        self.rows(entity)
    }

    async fn ping(&self) -> Result<()> {
        self.enter().await
    }
}

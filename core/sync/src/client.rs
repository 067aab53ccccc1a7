//! Application-facing handle.
//!
//! [`ShopSync`] is constructed explicitly and passed to whoever needs it;
//! there is no global instance. Every write lands in the local store and the
//! sync queue in one transaction and returns without touching the network.

use futures::future::try_join_all;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shopsync_common::{
    EntityType, Error, Fields, LocalRecord, MutationKind, RecordId, Result,
};
use shopsync_remote::RemoteSystem;
use shopsync_store::{
    FieldNormalizer, KvBackend, LocalStore, MemoryBackend, SqliteBackend, SyncOperation, SyncQueue,
    TerminalFailure, WriteBatch,
};

use crate::config::ShopSyncConfig;
use crate::conflict::{ConflictId, ConflictRecord, Resolution};
use crate::dedup::ReconcileReport;
use crate::engine::{DrainReport, SkipReason, SyncEngine};
use crate::network::{NetworkMonitor, RemoteProbe};
use crate::scheduler::{SyncMode, SyncScheduler};
use crate::state::{StatePublisher, SyncState};

/// Offline-first data access with background synchronization.
pub struct ShopSync {
    config: ShopSyncConfig,
    store: Arc<LocalStore>,
    queue: Arc<SyncQueue>,
    engine: Arc<SyncEngine>,
    network: Arc<NetworkMonitor>,
    state: Arc<StatePublisher>,
    scheduler: SyncScheduler,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShopSync {
    /// Open a SQLite-backed instance at `db_path`.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn open(
        db_path: impl AsRef<Path>,
        config: ShopSyncConfig,
        remote: Arc<dyn RemoteSystem>,
    ) -> Result<Self> {
        let backend = SqliteBackend::open(db_path)?;
        Self::with_backend(Arc::new(backend), config, remote).await
    }

    /// Create an instance whose local state lives only in memory.
    pub async fn in_memory(config: ShopSyncConfig, remote: Arc<dyn RemoteSystem>) -> Result<Self> {
        Self::with_backend(Arc::new(MemoryBackend::new()), config, remote).await
    }

    /// Create an instance over any persistence backend.
    ///
    /// Spawns the scheduler, which drains once right away if the remote
    /// answers a ping.
    pub async fn with_backend(
        backend: Arc<dyn KvBackend>,
        config: ShopSyncConfig,
        remote: Arc<dyn RemoteSystem>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(LocalStore::new(backend.clone(), config.normalizer.clone()));
        let queue = Arc::new(SyncQueue::open(backend, config.max_attempts)?);

        let initially_online = matches!(
            tokio::time::timeout(config.remote_timeout(), remote.ping()).await,
            Ok(Ok(()))
        );
        let network = NetworkMonitor::new(initially_online, config.network.stable_for());

        let state = Arc::new(StatePublisher::new(config.max_errors));
        let pending = queue.pending_count()?;
        state.update(|s| {
            s.is_online = initially_online;
            s.pending_count = pending;
        });

        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            queue.clone(),
            remote.clone(),
            network.clone(),
            state.clone(),
            &config,
        ));

        let mut tasks = Vec::new();
        let publisher = state.clone();
        tasks.push(network.on_change(move |online| publisher.set_online(online)));

        if config.network.probe_interval_ms > 0 {
            let probe = Arc::new(RemoteProbe::new(remote.clone()));
            tasks.push(network.spawn_probe(probe, config.network.probe_interval()));
        }

        let (scheduler, handle) = SyncScheduler::new(config.sync_mode);
        tasks.push(tokio::spawn(handle.run(engine.clone(), network.subscribe())));

        info!(
            "ShopSync ready ({} remote, {} pending, {})",
            remote.name(),
            pending,
            if initially_online { "online" } else { "offline" }
        );

        Ok(Self {
            config,
            store,
            queue,
            engine,
            network,
            state,
            scheduler,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &ShopSyncConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &FieldNormalizer {
        self.store.normalizer()
    }

    /// Connectivity monitor; feed it platform signals with `report`.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Insert a new record and queue its remote creation.
    ///
    /// # Errors
    /// - `AlreadyExists` if a record with this id exists locally
    pub fn create(&self, entity: EntityType, id: RecordId, fields: Fields) -> Result<LocalRecord> {
        if self.store.get(entity, &id)?.is_some() {
            return Err(Error::AlreadyExists(format!("{} {}", entity, id)));
        }

        let mut batch = WriteBatch::new();
        let record = self
            .store
            .stage_put(&mut batch, entity, LocalRecord::new(id.clone(), fields))?;
        let op = SyncOperation::new(
            entity,
            id,
            MutationKind::Create,
            record.fields.clone(),
            self.config.priority_of(entity),
        );
        self.queue.stage_enqueue(&mut batch, op)?;
        self.store.backend().commit(batch)?;

        self.after_write()?;
        Ok(record)
    }

    /// Insert a new record under a generated id.
    pub fn create_new(&self, entity: EntityType, fields: Fields) -> Result<LocalRecord> {
        self.create(entity, RecordId::generate(), fields)
    }

    /// Patch a record locally and queue the patch.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist locally
    pub fn update(&self, entity: EntityType, id: &RecordId, patch: Fields) -> Result<LocalRecord> {
        let mut record = self.store.require(entity, id)?;
        let patch = self.store.normalizer().to_canonical(&patch);
        let base_version = record.remote_version;
        record.apply_patch(&patch);

        let mut batch = WriteBatch::new();
        let record = self.store.stage_put(&mut batch, entity, record)?;
        let op = SyncOperation::new(
            entity,
            id.clone(),
            MutationKind::Update,
            patch,
            self.config.priority_of(entity),
        )
        .with_base_version(base_version);
        self.queue.stage_enqueue(&mut batch, op)?;
        self.store.backend().commit(batch)?;

        self.after_write()?;
        Ok(record)
    }

    /// Remove a record locally and queue its remote deletion.
    ///
    /// Succeeds without queuing anything if the record is unknown.
    pub fn delete(&self, entity: EntityType, id: &RecordId) -> Result<()> {
        let exists = self.store.get(entity, id)?.is_some();
        let binding = self.store.binding(entity, id)?;
        if !exists && binding.is_none() {
            debug!("Delete of unknown {} {} ignored", entity, id);
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        self.store.stage_remove(&mut batch, entity, id);
        let op = SyncOperation::new(
            entity,
            id.clone(),
            MutationKind::Delete,
            Fields::new(),
            self.config.priority_of(entity),
        )
        .with_base_version(binding.and_then(|b| b.remote_version));
        self.queue.stage_enqueue(&mut batch, op)?;
        self.store.backend().commit(batch)?;

        self.after_write()
    }

    fn after_write(&self) -> Result<()> {
        self.engine.refresh_pending()?;
        self.scheduler.notify_change();
        Ok(())
    }

    pub fn get(&self, entity: EntityType, id: &RecordId) -> Result<Option<LocalRecord>> {
        self.store.get(entity, id)
    }

    pub fn list(&self, entity: EntityType) -> Result<Vec<LocalRecord>> {
        self.store.list(entity)
    }

    /// Import a remote-shaped row as the local copy of `id`, without queuing.
    pub fn import_remote(
        &self,
        entity: EntityType,
        id: RecordId,
        row: Fields,
    ) -> Result<LocalRecord> {
        let record = shopsync_remote::RemoteRecord::from_row(row)?;
        self.store.put_remote(
            entity,
            id,
            record.remote_id,
            Some(record.updated_at),
            &record.fields,
        )
    }

    /// Operations not yet confirmed by the remote.
    pub fn pending_count(&self) -> Result<usize> {
        self.queue.pending_count()
    }

    /// Every queued operation in enqueue order.
    pub fn queued(&self) -> Result<Vec<SyncOperation>> {
        self.queue.all()
    }

    pub fn failures(&self) -> Result<Vec<TerminalFailure>> {
        self.queue.failures()
    }

    /// Forget terminal failures and the recent error list.
    pub fn clear_failures(&self) -> Result<()> {
        self.queue.clear_failures()?;
        self.state.clear_errors();
        Ok(())
    }

    /// Current sync state.
    pub fn state(&self) -> SyncState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    /// Drain now and wait for the report. A pass already running is not
    /// restarted.
    pub async fn force_sync(&self) -> Result<DrainReport> {
        if self.engine.is_draining() {
            debug!("Sync requested during a running pass; skipping");
            return Ok(DrainReport::skipped(SkipReason::AlreadyDraining));
        }
        self.scheduler.request_sync().await
    }

    pub fn set_mode(&self, mode: SyncMode) {
        self.scheduler.set_mode(mode);
    }

    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.engine.conflicts()
    }

    pub fn resolve_conflict(&self, id: &ConflictId, choice: Resolution) -> Result<()> {
        self.engine.resolve_conflict(id, choice)?;
        self.scheduler.notify_change();
        Ok(())
    }

    /// Remove remote duplicates in one collection, or in all of them.
    pub async fn reconcile(&self, entity: Option<EntityType>) -> Result<Vec<ReconcileReport>> {
        let entities = match entity {
            Some(entity) => vec![entity],
            None => EntityType::ALL.to_vec(),
        };

        try_join_all(entities.into_iter().map(|entity| self.engine.reconcile(entity))).await
    }

    /// Snapshot for display or logging.
    pub fn status_json(&self) -> Result<Value> {
        let state = self.state();
        Ok(serde_json::json!({
            "state": state,
            "failures": self.queue.failures()?.len(),
            "conflicts": self.conflicts()?.len(),
        }))
    }

    /// Stop background tasks. A running drain stops after its current
    /// operation.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        let mut tasks = tasks.into_iter().rev();
        if let Some(scheduler_task) = tasks.next() {
            if let Err(e) = scheduler_task.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        for task in tasks {
            task.abort();
        }
        info!("ShopSync shut down");
    }
}

impl Drop for ShopSync {
    fn drop(&mut self) {
        self.scheduler.shutdown_token().cancel();
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkConfig;
    use serde_json::json;
    use shopsync_remote::MemoryRemote;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn config() -> ShopSyncConfig {
        ShopSyncConfig {
            network: NetworkConfig {
                probe_interval_ms: 0,
                ..NetworkConfig::default()
            },
            ..ShopSyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_writes_pair_record_and_queue_entry() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_online(false);
        let sync = ShopSync::in_memory(config(), remote).await.unwrap();
        assert!(!sync.is_online());

        let id = RecordId::new("c1").unwrap();
        sync.create(EntityType::Customer, id.clone(), fields(json!({"name": "Ana", "debt": 100})))
            .unwrap();
        sync.update(EntityType::Customer, &id, fields(json!({"debt": 150})))
            .unwrap();

        let local = sync.get(EntityType::Customer, &id).unwrap().unwrap();
        assert_eq!(local.fields["debt"], 150);

        let queued = sync.queued().unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].kind, MutationKind::Create);
        assert_eq!(queued[1].payload, fields(json!({"debt": 150})));
        assert_eq!(sync.state().pending_count, 2);

        sync.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_rejects_existing_id() {
        let sync = ShopSync::in_memory(config(), Arc::new(MemoryRemote::new()))
            .await
            .unwrap();
        let id = RecordId::new("p1").unwrap();
        sync.create(EntityType::Product, id.clone(), Fields::new()).unwrap();

        let err = sync.create(EntityType::Product, id, Fields::new()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_unknown_is_noop() {
        let sync = ShopSync::in_memory(config(), Arc::new(MemoryRemote::new()))
            .await
            .unwrap();
        sync.delete(EntityType::Sale, &RecordId::new("missing").unwrap())
            .unwrap();
        assert_eq!(sync.pending_count().unwrap(), 0);
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_canonicalizes_patch() {
        let sync = ShopSync::in_memory(config(), Arc::new(MemoryRemote::new()))
            .await
            .unwrap();
        let id = RecordId::new("p1").unwrap();
        sync.create(EntityType::Product, id.clone(), fields(json!({"unitPrice": 2})))
            .unwrap();
        let record = sync
            .update(EntityType::Product, &id, fields(json!({"unit_price": 3})))
            .unwrap();

        assert_eq!(record.fields, fields(json!({"unitPrice": 3})));
        sync.shutdown().await;
    }
}

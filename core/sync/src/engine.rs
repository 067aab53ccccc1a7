//! Core sync engine that drains the queue into the remote system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shopsync_common::{
    ConflictSignal, EntityType, Error, ErrorClass, Fields, MutationKind, RecordId, Result,
};
use shopsync_remote::provider::domain_columns;
use shopsync_remote::RemoteSystem;
use shopsync_store::{
    BackoffOutcome, LocalStore, OperationStatus, RemoteBinding, SyncOperation, SyncQueue,
    WriteBatch,
};

use crate::config::ShopSyncConfig;
use crate::conflict::{ConflictId, ConflictRecord, ConflictResolver, Resolution};
use crate::dedup::{DedupGuard, ReconcileReport};
use crate::network::NetworkMonitor;
use crate::retry::RetryConfig;
use crate::state::{StatePublisher, SyncPhase};

/// Why a drain did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    Offline,
    AlreadyDraining,
}

/// Summary of one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Set when the pass never started.
    pub skipped: Option<SkipReason>,
    /// Pending operations at the start of the pass.
    pub total: usize,
    /// Applied remotely and removed from the queue.
    pub acknowledged: usize,
    /// Found already applied and removed without re-sending.
    pub deduplicated: usize,
    /// Failed transiently and returned to pending.
    pub retried: usize,
    /// Moved to the failure log.
    pub evicted: usize,
    /// Refused by the remote because its copy moved on.
    pub conflicts: usize,
    /// Left for a later pass without an attempt.
    pub deferred: usize,
    /// Stopped early by cancellation or loss of connectivity.
    pub interrupted: bool,
    pub duration_ms: u64,
}

impl DrainReport {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Whether the pass was refused at entry.
    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    /// Operations that left the queue successfully.
    pub fn synced(&self) -> usize {
        self.acknowledged + self.deduplicated
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Acknowledged => self.acknowledged += 1,
            Outcome::Deduplicated => self.deduplicated += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Evicted => self.evicted += 1,
            Outcome::Conflicted => self.conflicts += 1,
            Outcome::Deferred => self.deferred += 1,
        }
    }
}

/// What happened to a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acknowledged,
    Deduplicated,
    Retried,
    Evicted,
    Conflicted,
    Deferred,
}

impl Outcome {
    /// Later operations of the same record wait for the next pass.
    fn blocks_entity(self) -> bool {
        !matches!(self, Outcome::Acknowledged | Outcome::Deduplicated)
    }
}

/// Single-flight guard. Dropping it publishes the idle state.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
    state: &'a StatePublisher,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool, state: &'a StatePublisher) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag, state })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.state.update(|s| {
            s.is_syncing = false;
            s.phase = SyncPhase::Idle;
        });
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Sync engine: the only component that removes queue entries.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    queue: Arc<SyncQueue>,
    remote: Arc<dyn RemoteSystem>,
    network: Arc<NetworkMonitor>,
    state: Arc<StatePublisher>,
    dedup: DedupGuard,
    resolver: ConflictResolver,
    retry: RetryConfig,
    auto_resolve: Option<Resolution>,
    remote_timeout: Duration,
    conflicts: Mutex<HashMap<ConflictId, ConflictRecord>>,
    draining: AtomicBool,
}

impl SyncEngine {
    /// Create an engine over shared store, queue and connectivity state.
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<SyncQueue>,
        remote: Arc<dyn RemoteSystem>,
        network: Arc<NetworkMonitor>,
        state: Arc<StatePublisher>,
        config: &ShopSyncConfig,
    ) -> Self {
        Self {
            dedup: DedupGuard::new(remote.clone(), config.dedup.clone()),
            resolver: ConflictResolver::new(config.conflict.merge_policy.build()),
            retry: config.retry.clone(),
            auto_resolve: config
                .conflict
                .auto_resolve
                .filter(|choice| *choice != Resolution::Pending),
            remote_timeout: config.remote_timeout(),
            store,
            queue,
            remote,
            network,
            state,
            conflicts: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<dyn RemoteSystem> {
        &self.remote
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn state(&self) -> &Arc<StatePublisher> {
        &self.state
    }

    /// Whether a pass is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Earliest time a backed-off operation becomes due.
    pub fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.queue.next_due_at()
    }

    /// Republish the queue length after a local write.
    pub fn refresh_pending(&self) -> Result<()> {
        let pending = self.queue.pending_count()?;
        self.state.update(|s| s.pending_count = pending);
        Ok(())
    }

    /// Run one pass to completion.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.drain_with(&CancellationToken::new()).await
    }

    /// Run one pass, stopping between operations once `cancel` fires.
    ///
    /// Returns a skipped report when offline or when another pass is running.
    /// Remote failures are recorded per operation and never abort the pass;
    /// local storage errors do.
    pub async fn drain_with(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        if !self.network.is_online() {
            self.state.set_online(false);
            debug!("Drain skipped: offline");
            return Ok(DrainReport::skipped(SkipReason::Offline));
        }
        let _guard = match DrainGuard::acquire(&self.draining, &self.state) {
            Some(guard) => guard,
            None => {
                debug!("Drain skipped: already draining");
                return Ok(DrainReport::skipped(SkipReason::AlreadyDraining));
            }
        };

        let started = Instant::now();
        self.evict_leftovers()?;

        let ops = self.queue.dequeue_ordered()?;
        let mut blocked: HashSet<(EntityType, RecordId)> = self
            .queue
            .all()?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Conflicted)
            .map(|op| op.entity_key())
            .collect();

        let mut report = DrainReport {
            total: ops.len(),
            ..DrainReport::default()
        };
        let total = ops.len();
        info!("Draining {} queued operation(s)", total);
        self.state.update(|s| {
            s.is_online = true;
            s.is_syncing = true;
            s.phase = SyncPhase::Draining;
            s.processed = 0;
            s.total = total;
        });

        for (index, op) in ops.into_iter().enumerate() {
            if cancel.is_cancelled() || !self.network.is_online() {
                info!("Drain interrupted after {} of {} operation(s)", index, total);
                report.interrupted = true;
                break;
            }

            let key = op.entity_key();
            if blocked.contains(&key) || !op.is_due(Utc::now()) {
                debug!("Deferring {} {} {}", op.kind, op.entity, op.record_id);
                blocked.insert(key);
                report.record(Outcome::Deferred);
            } else {
                let id = op.operation_id;
                let outcome = match self.process(op).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        if let Err(reset) = self.queue.mark(&id, OperationStatus::Pending) {
                            warn!("Failed to return operation {} to pending: {}", id, reset);
                        }
                        return Err(e);
                    }
                };
                if outcome.blocks_entity() {
                    blocked.insert(key);
                }
                report.record(outcome);
            }

            let pending = self.queue.pending_count()?;
            self.state.update(|s| {
                s.phase = SyncPhase::Draining;
                s.processed = index + 1;
                s.pending_count = pending;
            });
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        let pending = self.queue.pending_count()?;
        self.state.update(|s| {
            s.pending_count = pending;
            s.last_sync_time = Some(Utc::now());
        });

        info!(
            "Drain finished in {}ms: {} synced, {} retried, {} evicted, {} conflicts, {} deferred",
            report.duration_ms,
            report.synced(),
            report.retried,
            report.evicted,
            report.conflicts,
            report.deferred
        );
        Ok(report)
    }

    /// Operations a crashed pass marked terminal but never moved to the log.
    fn evict_leftovers(&self) -> Result<()> {
        for op in self.queue.all()? {
            if op.status == OperationStatus::FailedTerminal {
                let message = op
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "attempts exhausted".to_string());
                self.evict(&op, ErrorClass::Transient, &message)?;
            }
        }
        Ok(())
    }

    fn phase(&self, phase: SyncPhase) {
        self.state.update(|s| s.phase = phase);
    }

    /// Bound a remote call by the configured deadline.
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.remote_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "remote call exceeded {}ms",
                self.remote_timeout.as_millis()
            ))),
        }
    }

    async fn process(&self, op: SyncOperation) -> Result<Outcome> {
        let op = self.queue.mark(&op.operation_id, OperationStatus::InFlight)?;
        debug!(
            "Applying {} {} {} (attempt {})",
            op.kind,
            op.entity,
            op.record_id,
            op.attempts + 1
        );

        self.phase(SyncPhase::Normalizing);
        let payload = domain_columns(self.store.normalizer().to_remote(&op.payload));
        let binding = self.store.binding(op.entity, &op.record_id)?;

        match (op.kind, binding) {
            (MutationKind::Create, binding) => self.apply_create(&op, payload, binding).await,
            (MutationKind::Update, Some(binding)) => self.apply_update(&op, payload, binding).await,
            (MutationKind::Delete, Some(binding)) => self.apply_delete(&op, binding).await,
            (_, None) => self.unbound(&op),
        }
    }

    async fn apply_create(
        &self,
        op: &SyncOperation,
        payload: Fields,
        binding: Option<RemoteBinding>,
    ) -> Result<Outcome> {
        if let Some(binding) = binding {
            debug!(
                "{} {} already bound to {}",
                op.entity, op.record_id, binding.remote_id
            );
            self.queue.acknowledge(&op.operation_id)?;
            return Ok(Outcome::Deduplicated);
        }

        self.phase(SyncPhase::DedupChecking);
        match self.call(self.dedup.exists_remotely(op, &payload)).await {
            Ok(Some(existing)) => {
                self.confirm(op, &existing.remote_id, Some(existing.updated_at))?;
                return Ok(Outcome::Deduplicated);
            }
            Ok(None) => {}
            Err(e) => return self.fail(op, e),
        }

        self.phase(SyncPhase::Applying);
        let key = op.operation_id.idempotency_key();
        match self
            .call(self.remote.create(op.entity, payload, Some(key.as_str())))
            .await
        {
            Ok(created) => {
                self.confirm(op, &created.remote_id, Some(created.updated_at))?;
                Ok(Outcome::Acknowledged)
            }
            Err(e) => self.fail(op, e),
        }
    }

    async fn apply_update(
        &self,
        op: &SyncOperation,
        payload: Fields,
        binding: RemoteBinding,
    ) -> Result<Outcome> {
        self.phase(SyncPhase::Applying);
        // The binding tracks our own confirmed writes, so consecutive local
        // updates never conflict with each other.
        let expected = binding.remote_version.or(op.base_version);

        match self
            .call(
                self.remote
                    .update(op.entity, &binding.remote_id, payload, expected),
            )
            .await
        {
            Ok(updated) => {
                self.confirm(op, &updated.remote_id, Some(updated.updated_at))?;
                Ok(Outcome::Acknowledged)
            }
            Err(Error::NotFound(message)) => {
                self.evict(op, ErrorClass::Validation, &message)?;
                Ok(Outcome::Evicted)
            }
            Err(e) => self.fail(op, e),
        }
    }

    async fn apply_delete(&self, op: &SyncOperation, binding: RemoteBinding) -> Result<Outcome> {
        self.phase(SyncPhase::Applying);
        match self
            .call(self.remote.delete(op.entity, &binding.remote_id))
            .await
        {
            Ok(()) | Err(Error::NotFound(_)) => {
                self.phase(SyncPhase::Acknowledging);
                let mut batch = WriteBatch::new();
                self.store
                    .stage_unbind_remote(&mut batch, op.entity, &op.record_id);
                self.queue.stage_acknowledge(&mut batch, &op.operation_id);
                self.store.backend().commit(batch)?;
                Ok(Outcome::Acknowledged)
            }
            Err(e) => self.fail(op, e),
        }
    }

    /// Update or delete of a record the remote has never confirmed.
    fn unbound(&self, op: &SyncOperation) -> Result<Outcome> {
        let create_queued = self.queue.all()?.iter().any(|other| {
            other.kind == MutationKind::Create
                && other.entity == op.entity
                && other.record_id == op.record_id
                && other.operation_id != op.operation_id
        });

        if create_queued {
            self.queue.mark(&op.operation_id, OperationStatus::Pending)?;
            return Ok(Outcome::Deferred);
        }

        match op.kind {
            MutationKind::Delete => {
                debug!(
                    "{} {} never reached the remote; nothing to delete",
                    op.entity, op.record_id
                );
                self.queue.acknowledge(&op.operation_id)?;
                Ok(Outcome::Acknowledged)
            }
            _ => {
                self.evict(
                    op,
                    ErrorClass::Validation,
                    "record has no remote id and no queued create",
                )?;
                Ok(Outcome::Evicted)
            }
        }
    }

    /// Bind the remote identity and acknowledge in one transaction.
    fn confirm(
        &self,
        op: &SyncOperation,
        remote_id: &str,
        version: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.phase(SyncPhase::Acknowledging);
        let mut batch = WriteBatch::new();
        self.store
            .stage_bind_remote(&mut batch, op.entity, &op.record_id, remote_id, version)?;
        self.queue.stage_acknowledge(&mut batch, &op.operation_id);
        self.store.backend().commit(batch)?;
        debug!(
            "Confirmed {} {} {} as {}",
            op.kind, op.entity, op.record_id, remote_id
        );
        Ok(())
    }

    /// Route a failed remote call by error class. Conflicts are parked,
    /// never retried blindly.
    fn fail(&self, op: &SyncOperation, err: Error) -> Result<Outcome> {
        let class = err.class();
        let message = match err {
            Error::Conflict(signal) => return self.on_conflict(op, *signal),
            other => other.to_string(),
        };
        if class == ErrorClass::Validation {
            self.evict(op, ErrorClass::Validation, &message)?;
            return Ok(Outcome::Evicted);
        }

        self.phase(SyncPhase::Backoff);
        let delay = self.retry.backoff_after(op.attempts + 1);
        match self
            .queue
            .requeue_with_backoff(&op.operation_id, &message, delay)?
        {
            BackoffOutcome::Retry(op) => {
                warn!(
                    "{} {} {} failed (attempt {}), retrying in {}ms: {}",
                    op.kind,
                    op.entity,
                    op.record_id,
                    op.attempts,
                    delay.as_millis(),
                    message
                );
                Ok(Outcome::Retried)
            }
            BackoffOutcome::Terminal(op) => {
                self.evict(&op, ErrorClass::Transient, &message)?;
                Ok(Outcome::Evicted)
            }
        }
    }

    fn evict(&self, op: &SyncOperation, class: ErrorClass, message: &str) -> Result<()> {
        let failure = self.queue.evict(&op.operation_id, class, message)?;
        self.state.push_error(failure.summary());
        Ok(())
    }

    fn on_conflict(&self, op: &SyncOperation, signal: ConflictSignal) -> Result<Outcome> {
        let conflict = ConflictRecord {
            id: ConflictId::new(),
            entity: op.entity,
            record_id: op.record_id.clone(),
            operation_id: op.operation_id,
            remote_id: signal.remote_id,
            local_payload: op.payload.clone(),
            remote_payload: self
                .store
                .normalizer()
                .to_canonical(&domain_columns(signal.remote)),
            remote_version: signal.remote_version,
            resolution: Resolution::Pending,
            detected_at: Utc::now(),
        };
        warn!(
            "Conflict on {} {} (remote {})",
            conflict.entity, conflict.record_id, conflict.remote_id
        );

        if let Some(choice) = self.auto_resolve {
            info!("Auto-resolving conflict {} with {}", conflict.id, choice);
            self.apply_resolution(&conflict, choice)?;
            return Ok(Outcome::Conflicted);
        }

        self.queue
            .mark(&op.operation_id, OperationStatus::Conflicted)?;
        self.state.push_error(format!(
            "Conflict on {} {}: awaiting resolution",
            conflict.entity, conflict.record_id
        ));
        self.lock_conflicts()?.insert(conflict.id, conflict);
        Ok(Outcome::Conflicted)
    }

    fn lock_conflicts(&self) -> Result<MutexGuard<'_, HashMap<ConflictId, ConflictRecord>>> {
        self.conflicts
            .lock()
            .map_err(|_| Error::Storage("Conflict table lock poisoned".to_string()))
    }

    /// Unresolved conflicts, oldest first.
    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let mut conflicts: Vec<_> = self.lock_conflicts()?.values().cloned().collect();
        conflicts.sort_by_key(|c| c.detected_at);
        Ok(conflicts)
    }

    /// Settle a parked conflict.
    ///
    /// `Remote` adopts the remote copy locally and drops the queued mutation.
    /// `Local` and `Merge` rewrite the queued mutation against the remote
    /// version and return it to pending for the next pass.
    pub fn resolve_conflict(&self, id: &ConflictId, choice: Resolution) -> Result<()> {
        if choice == Resolution::Pending {
            return Err(Error::InvalidInput(
                "pending does not resolve a conflict".to_string(),
            ));
        }

        let conflict = self
            .lock_conflicts()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", id)))?;

        self.apply_resolution(&conflict, choice)?;
        self.lock_conflicts()?.remove(id);
        self.refresh_pending()?;
        info!(
            "Resolved conflict on {} {} with {}",
            conflict.entity, conflict.record_id, choice
        );
        Ok(())
    }

    fn apply_resolution(&self, conflict: &ConflictRecord, choice: Resolution) -> Result<()> {
        let resolved = self.resolver.resolve(conflict, choice).ok_or_else(|| {
            Error::InvalidInput("pending does not resolve a conflict".to_string())
        })?;
        let entity = conflict.entity;
        let record_id = &conflict.record_id;

        let mut batch = WriteBatch::new();
        match choice {
            Resolution::Remote => {
                // A record deleted locally since stays deleted.
                match self.store.get(entity, record_id)? {
                    Some(mut record) => {
                        record.fields = resolved;
                        record.remote_id = Some(conflict.remote_id.clone());
                        record.remote_version = conflict.remote_version;
                        self.store.stage_put(&mut batch, entity, record)?;
                    }
                    None => self.store.stage_bind_remote(
                        &mut batch,
                        entity,
                        record_id,
                        &conflict.remote_id,
                        conflict.remote_version,
                    )?,
                }
                self.queue
                    .stage_acknowledge(&mut batch, &conflict.operation_id);
                self.store.backend().commit(batch)?;
            }
            _ => {
                self.store.stage_bind_remote(
                    &mut batch,
                    entity,
                    record_id,
                    &conflict.remote_id,
                    conflict.remote_version,
                )?;
                if choice == Resolution::Merge {
                    if let Some(mut record) = self.store.get(entity, record_id)? {
                        record.apply_patch(&resolved);
                        record.remote_id = Some(conflict.remote_id.clone());
                        record.remote_version = conflict.remote_version;
                        self.store.stage_put(&mut batch, entity, record)?;
                    }
                }
                self.store.backend().commit(batch)?;
                self.queue.replace_payload(
                    &conflict.operation_id,
                    resolved,
                    conflict.remote_version,
                )?;
            }
        }
        Ok(())
    }

    /// Remove remote duplicates of `entity` and point local records that
    /// referenced a removed row at the surviving one.
    pub async fn reconcile(&self, entity: EntityType) -> Result<ReconcileReport> {
        let report = self.call(self.dedup.reconcile(entity)).await?;

        for (removed, kept) in &report.replacements {
            let version = self
                .call(self.remote.get(entity, kept))
                .await?
                .map(|row| row.updated_at);
            let mut batch = WriteBatch::new();
            for record in self.store.list(entity)? {
                if record.remote_id.as_deref() == Some(removed.as_str()) {
                    self.store
                        .stage_bind_remote(&mut batch, entity, &record.id, kept, version)?;
                }
            }
            if !batch.is_empty() {
                debug!("Rebinding local {} from {} to {}", entity, removed, kept);
                self.store.backend().commit(batch)?;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shopsync_common::{LocalRecord, Priority};
    use shopsync_remote::{Fault, MemoryRemote};
    use shopsync_store::{FieldNormalizer, KvBackend, MemoryBackend};

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn config() -> ShopSyncConfig {
        ShopSyncConfig {
            retry: RetryConfig::immediate(),
            ..ShopSyncConfig::default()
        }
    }

    fn engine(remote: Arc<MemoryRemote>, config: &ShopSyncConfig) -> SyncEngine {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let store = Arc::new(LocalStore::new(backend.clone(), FieldNormalizer::new()));
        let queue = Arc::new(SyncQueue::open(backend, config.max_attempts).unwrap());
        let network = NetworkMonitor::new(true, config.network.stable_for());
        SyncEngine::new(
            store,
            queue,
            remote,
            network,
            Arc::new(StatePublisher::default()),
            config,
        )
    }

    fn write(
        engine: &SyncEngine,
        entity: EntityType,
        id: &str,
        kind: MutationKind,
        payload: Fields,
    ) {
        let record_id = RecordId::new(id).unwrap();
        let mut batch = WriteBatch::new();
        if kind != MutationKind::Delete {
            let record = LocalRecord::new(record_id.clone(), payload.clone());
            engine
                .store()
                .stage_put(&mut batch, entity, record)
                .unwrap();
        }
        let op = SyncOperation::new(entity, record_id, kind, payload, Priority::Medium);
        engine.queue().stage_enqueue(&mut batch, op).unwrap();
        engine.store().backend().commit(batch).unwrap();
    }

    #[tokio::test]
    async fn test_create_binds_and_acknowledges() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = engine(remote.clone(), &config());
        write(
            &engine,
            EntityType::Product,
            "p1",
            MutationKind::Create,
            fields(json!({"name": "Rice", "unitPrice": 3})),
        );

        let report = engine.drain().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert!(engine.queue().is_empty().unwrap());

        let rows = remote.rows(EntityType::Product).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields["unit_price"], 3);

        let local = engine
            .store()
            .require(EntityType::Product, &RecordId::new("p1").unwrap())
            .unwrap();
        assert_eq!(local.remote_id.as_deref(), Some(rows[0].remote_id.as_str()));
        assert_eq!(local.remote_version, Some(rows[0].updated_at));
    }

    #[tokio::test]
    async fn test_offline_drain_is_skipped() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = engine(remote.clone(), &config());
        write(&engine, EntityType::Sale, "s1", MutationKind::Create, fields(json!({"total": 5})));

        engine.network().report(false);
        let report = engine.drain().await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Offline));
        assert_eq!(remote.create_calls(), 0);
        assert_eq!(engine.queue().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_validation_error_evicts_immediately() {
        let remote = Arc::new(MemoryRemote::new());
        remote.require_column(EntityType::Sale, "customer_id");
        let engine = engine(remote.clone(), &config());
        write(&engine, EntityType::Sale, "s1", MutationKind::Create, fields(json!({"total": 5})));

        let report = engine.drain().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(engine.queue().is_empty().unwrap());

        let failures = engine.queue().failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].class, ErrorClass::Validation);
        assert_eq!(engine.state().current().errors.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .push_fault(Fault::Fail(Error::Unavailable("503".into())))
            .unwrap();
        let engine = engine(remote.clone(), &config());
        write(&engine, EntityType::Sale, "s1", MutationKind::Create, fields(json!({"total": 5})));

        let first = engine.drain().await.unwrap();
        assert_eq!(first.retried, 1);
        let op = &engine.queue().all().unwrap()[0];
        assert_eq!(op.attempts, 1);
        assert_eq!(op.status, OperationStatus::Pending);

        let second = engine.drain().await.unwrap();
        assert_eq!(second.acknowledged, 1);
        assert_eq!(remote.rows(EntityType::Sale).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_window_defers_operation() {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .push_fault(Fault::Fail(Error::Network("reset".into())))
            .unwrap();
        let config = ShopSyncConfig {
            retry: RetryConfig::new(Duration::from_secs(60)).with_jitter(false),
            ..ShopSyncConfig::default()
        };
        let engine = engine(remote.clone(), &config);
        write(&engine, EntityType::Sale, "s1", MutationKind::Create, fields(json!({"total": 5})));

        assert_eq!(engine.drain().await.unwrap().retried, 1);
        let second = engine.drain().await.unwrap();
        assert_eq!(second.deferred, 1);
        assert_eq!(remote.create_calls(), 1);
        assert!(engine.next_retry_at().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_of_missing_remote_row_succeeds() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = engine(remote.clone(), &config());
        write(
            &engine,
            EntityType::Customer,
            "c1",
            MutationKind::Create,
            fields(json!({"name": "Ana"})),
        );
        engine.drain().await.unwrap();

        let remote_id = remote.rows(EntityType::Customer).unwrap()[0].remote_id.clone();
        remote.delete(EntityType::Customer, &remote_id).await.unwrap();

        write(&engine, EntityType::Customer, "c1", MutationKind::Delete, Fields::new());
        let report = engine.drain().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert!(engine
            .store()
            .binding(EntityType::Customer, &RecordId::new("c1").unwrap())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_conflict_on_create_is_parked_not_retried() {
        let remote = Arc::new(MemoryRemote::new());
        remote
            .push_fault(Fault::Fail(Error::conflict(ConflictSignal {
                entity: EntityType::Sale,
                remote_id: "r-other".to_string(),
                remote_version: None,
                remote: fields(json!({"total": 9})),
            })))
            .unwrap();
        let engine = engine(remote.clone(), &config());
        write(
            &engine,
            EntityType::Sale,
            "s1",
            MutationKind::Create,
            fields(json!({"total": 5})),
        );

        let first = engine.drain().await.unwrap();
        assert_eq!(first.conflicts, 1);
        assert_eq!(first.retried, 0);

        let op = &engine.queue().all().unwrap()[0];
        assert_eq!(op.status, OperationStatus::Conflicted);
        assert_eq!(op.attempts, 0);

        let conflicts = engine.conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].remote_id, "r-other");
        assert_eq!(conflicts[0].remote_payload["total"], 9);

        let second = engine.drain().await.unwrap();
        assert_eq!(second.total, 0);
        assert!(remote.rows(EntityType::Sale).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_latency(Some(Duration::from_millis(200)));
        let config = ShopSyncConfig {
            remote_timeout_ms: 20,
            ..config()
        };
        let engine = engine(remote.clone(), &config);
        write(
            &engine,
            EntityType::Product,
            "p1",
            MutationKind::Create,
            fields(json!({"name": "Oil"})),
        );

        let report = engine.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        let op = &engine.queue().all().unwrap()[0];
        assert!(op.last_error.as_deref().unwrap_or_default().contains("Timed out"));
    }
}

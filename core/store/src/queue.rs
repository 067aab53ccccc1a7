//! Persistent queue of mutations not yet confirmed by the remote system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use shopsync_common::{
    EntityType, Error, ErrorClass, Fields, MutationKind, OperationId, Priority, RecordId, Result,
};

use crate::backend::{KvBackend, WriteBatch};

const QUEUE_NS: &str = "sync_queue";
const FAILURES_NS: &str = "sync_failures";

/// Default number of attempts before an operation fails terminally.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    /// Waiting for the next drain.
    Pending,
    /// Being applied by the current drain.
    InFlight,
    /// Parked until a conflict is resolved.
    Conflicted,
    /// Exhausted its attempts; about to be evicted.
    FailedTerminal,
}

/// A queued intent to mutate the remote system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Never reused; doubles as the idempotency key.
    pub operation_id: OperationId,
    pub entity: EntityType,
    /// Local id of the target record.
    pub record_id: RecordId,
    pub kind: MutationKind,
    /// Canonical snapshot (create) or partial update.
    pub payload: Fields,
    /// Remote version the payload was derived from.
    #[serde(default)]
    pub base_version: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Enqueue sequence, breaks `created_at` ties.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time the next attempt may run.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub status: OperationStatus,
}

impl SyncOperation {
    /// Create a new pending operation with a freshly minted id.
    pub fn new(
        entity: EntityType,
        record_id: RecordId,
        kind: MutationKind,
        payload: Fields,
        priority: Priority,
    ) -> Self {
        Self {
            operation_id: OperationId::new(),
            entity,
            record_id,
            kind,
            payload,
            base_version: None,
            priority,
            created_at: Utc::now(),
            seq: 0,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            next_attempt_at: None,
            status: OperationStatus::Pending,
        }
    }

    /// Set the remote version the payload was derived from.
    pub fn with_base_version(mut self, version: Option<DateTime<Utc>>) -> Self {
        self.base_version = version;
        self
    }

    /// Whether the backoff window has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Key grouping all operations on the same record.
    pub fn entity_key(&self) -> (EntityType, RecordId) {
        (self.entity, self.record_id.clone())
    }
}

/// An operation removed from the queue without reaching the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalFailure {
    pub operation: SyncOperation,
    pub class: ErrorClass,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl TerminalFailure {
    /// One-line description for user-facing error lists.
    pub fn summary(&self) -> String {
        format!(
            "{} {} {} failed after {} attempt(s): {}",
            self.operation.kind,
            self.operation.entity,
            self.operation.record_id,
            self.operation.attempts,
            self.message
        )
    }
}

/// Result of [`SyncQueue::requeue_with_backoff`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffOutcome {
    /// Returned to pending for a later attempt.
    Retry(SyncOperation),
    /// Reached the attempt limit; the caller must evict it.
    Terminal(SyncOperation),
}

/// Ordered, persisted list of pending mutations.
pub struct SyncQueue {
    backend: Arc<dyn KvBackend>,
    max_attempts: u32,
    next_seq: AtomicU64,
}

impl SyncQueue {
    /// Open the queue stored in `backend`.
    ///
    /// Operations left `in-flight` or `conflicted` by a previous process are
    /// returned to `pending`; conflict records do not outlive the process.
    pub fn open(backend: Arc<dyn KvBackend>, max_attempts: u32) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let queue = Self {
            backend,
            max_attempts,
            next_seq: AtomicU64::new(0),
        };

        let ops = queue.all()?;
        let next_seq = ops.iter().map(|op| op.seq + 1).max().unwrap_or(0);
        queue.next_seq.store(next_seq, Ordering::SeqCst);

        let mut batch = WriteBatch::new();
        for mut op in ops {
            if matches!(op.status, OperationStatus::InFlight | OperationStatus::Conflicted) {
                op.status = OperationStatus::Pending;
                batch.put(QUEUE_NS, &op.operation_id.to_string(), &op)?;
            }
        }
        if !batch.is_empty() {
            info!("Recovered {} interrupted operations", batch.len());
            queue.backend.commit(batch)?;
        }

        Ok(queue)
    }

    /// Maximum attempts before terminal failure.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Append an operation.
    pub fn enqueue(&self, op: SyncOperation) -> Result<SyncOperation> {
        let mut batch = WriteBatch::new();
        let op = self.stage_enqueue(&mut batch, op)?;
        self.backend.commit(batch)?;
        Ok(op)
    }

    /// Stage an append without committing, assigning status and sequence.
    pub fn stage_enqueue(
        &self,
        batch: &mut WriteBatch,
        mut op: SyncOperation,
    ) -> Result<SyncOperation> {
        op.status = OperationStatus::Pending;
        op.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        batch.put(QUEUE_NS, &op.operation_id.to_string(), &op)?;
        debug!(
            "Enqueued {} {} {} ({:?})",
            op.kind, op.entity, op.record_id, op.priority
        );
        Ok(op)
    }

    /// Get one operation.
    pub fn get(&self, id: &OperationId) -> Result<Option<SyncOperation>> {
        self.backend
            .get(QUEUE_NS, &id.to_string())?
            .map(|value| serde_json::from_value(value).map_err(Error::from))
            .transpose()
    }

    fn require(&self, id: &OperationId) -> Result<SyncOperation> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("Queued operation not found: {}", id)))
    }

    fn save(&self, op: &SyncOperation) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(QUEUE_NS, &op.operation_id.to_string(), op)?;
        self.backend.commit(batch)
    }

    /// Every queued operation in any status, in enqueue order.
    pub fn all(&self) -> Result<Vec<SyncOperation>> {
        let mut ops = self
            .backend
            .scan(QUEUE_NS)?
            .into_iter()
            .map(|(_, value)| serde_json::from_value::<SyncOperation>(value).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        ops.sort_by_key(|op| op.seq);
        Ok(ops)
    }

    /// The pending set in processing order.
    ///
    /// Sorted by `(priority desc, created_at asc, seq asc)`, then re-threaded
    /// so the slots belonging to one record are filled with that record's
    /// operations in enqueue order.
    pub fn dequeue_ordered(&self) -> Result<Vec<SyncOperation>> {
        let pending = self
            .all()?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .collect();
        Ok(order(pending))
    }

    /// Remove an operation after confirmed remote success.
    pub fn acknowledge(&self, id: &OperationId) -> Result<()> {
        let mut batch = WriteBatch::new();
        self.stage_acknowledge(&mut batch, id);
        self.backend.commit(batch)
    }

    /// Stage removal of an acknowledged operation.
    pub fn stage_acknowledge(&self, batch: &mut WriteBatch, id: &OperationId) {
        batch.delete(QUEUE_NS, &id.to_string());
    }

    /// Set an operation's status.
    pub fn mark(&self, id: &OperationId, status: OperationStatus) -> Result<SyncOperation> {
        let mut op = self.require(id)?;
        op.status = status;
        self.save(&op)?;
        Ok(op)
    }

    /// Record a failed attempt.
    ///
    /// Increments `attempts` and stamps `last_attempt_at`. Below the limit
    /// the operation returns to `pending` and is not due again for `delay`;
    /// at the limit it becomes `failed-terminal` and the caller is told to
    /// evict it.
    pub fn requeue_with_backoff(
        &self,
        id: &OperationId,
        error: &str,
        delay: Duration,
    ) -> Result<BackoffOutcome> {
        let mut op = self.require(id)?;
        let now = Utc::now();
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        op.attempts += 1;
        op.last_attempt_at = Some(now);
        op.last_error = Some(error.to_string());
        op.next_attempt_at = Some(now + delay);

        if op.attempts >= self.max_attempts {
            op.status = OperationStatus::FailedTerminal;
            self.save(&op)?;
            warn!(
                "Operation {} failed terminally after {} attempts: {}",
                op.operation_id, op.attempts, error
            );
            Ok(BackoffOutcome::Terminal(op))
        } else {
            op.status = OperationStatus::Pending;
            self.save(&op)?;
            debug!(
                "Operation {} requeued (attempt {}/{})",
                op.operation_id, op.attempts, self.max_attempts
            );
            Ok(BackoffOutcome::Retry(op))
        }
    }

    /// Remove an operation and append it to the failure log atomically.
    pub fn evict(
        &self,
        id: &OperationId,
        class: ErrorClass,
        message: &str,
    ) -> Result<TerminalFailure> {
        let mut op = self.require(id)?;
        op.status = OperationStatus::FailedTerminal;
        if op.last_error.is_none() {
            op.last_error = Some(message.to_string());
        }

        let failure = TerminalFailure {
            operation: op,
            class,
            message: message.to_string(),
            failed_at: Utc::now(),
        };

        let mut batch = WriteBatch::new();
        batch.delete(QUEUE_NS, &id.to_string());
        batch.put(FAILURES_NS, &id.to_string(), &failure)?;
        self.backend.commit(batch)?;

        warn!("Evicted operation {}: {}", id, failure.summary());
        Ok(failure)
    }

    /// Replace an operation's payload and base version and return it to
    /// `pending`. Used when a conflict resolution rewrites the mutation.
    pub fn replace_payload(
        &self,
        id: &OperationId,
        payload: Fields,
        base_version: Option<DateTime<Utc>>,
    ) -> Result<SyncOperation> {
        let mut op = self.require(id)?;
        op.payload = payload;
        op.base_version = base_version;
        op.next_attempt_at = None;
        op.status = OperationStatus::Pending;
        self.save(&op)?;
        Ok(op)
    }

    /// Earliest backoff expiry among pending operations still waiting.
    pub fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .filter_map(|op| op.next_attempt_at)
            .min())
    }

    /// Number of queued operations in any status.
    pub fn len(&self) -> Result<usize> {
        Ok(self.backend.scan(QUEUE_NS)?.len())
    }

    /// Number of operations not yet confirmed by the remote.
    pub fn pending_count(&self) -> Result<usize> {
        self.len()
    }

    /// Whether the queue holds no operations.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Terminal failures, oldest first.
    pub fn failures(&self) -> Result<Vec<TerminalFailure>> {
        let mut failures = self
            .backend
            .scan(FAILURES_NS)?
            .into_iter()
            .map(|(_, value)| serde_json::from_value::<TerminalFailure>(value).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;
        failures.sort_by_key(|f| f.failed_at);
        Ok(failures)
    }

    /// Forget all recorded terminal failures.
    pub fn clear_failures(&self) -> Result<()> {
        self.backend.clear(FAILURES_NS)
    }
}

/// Processing order for a set of operations.
fn order(mut ops: Vec<SyncOperation>) -> Vec<SyncOperation> {
    ops.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.seq.cmp(&b.seq))
    });

    let slots: Vec<(EntityType, RecordId)> = ops.iter().map(SyncOperation::entity_key).collect();

    let mut by_entity: HashMap<(EntityType, RecordId), Vec<SyncOperation>> = HashMap::new();
    for op in ops {
        by_entity.entry(op.entity_key()).or_default().push(op);
    }
    let mut by_entity: HashMap<(EntityType, RecordId), VecDeque<SyncOperation>> = by_entity
        .into_iter()
        .map(|(key, mut group)| {
            group.sort_by_key(|op| op.seq);
            (key, group.into())
        })
        .collect();

    slots
        .iter()
        .filter_map(|key| by_entity.get_mut(key).and_then(VecDeque::pop_front))
        .collect()
}

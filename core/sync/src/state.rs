//! Observable sync state.
//!
//! [`SyncState`] is rebuilt from the queue and the network monitor on every
//! pass and never persisted; the queue stays the source of truth for what
//! remains pending. The engine is the only writer, through [`StatePublisher`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::watch;

use shopsync_common::{Error, Result};

/// Default capacity of the recent error list.
pub const DEFAULT_MAX_ERRORS: usize = 50;

/// Where the engine is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Idle,
    Draining,
    Normalizing,
    DedupChecking,
    Applying,
    Acknowledging,
    Backoff,
}

/// Snapshot of sync progress for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_online: bool,
    pub is_syncing: bool,
    pub phase: SyncPhase,
    /// Progress of the current pass, 0 to 100.
    pub progress_percent: u8,
    /// Operations handled in the current pass.
    pub processed: usize,
    /// Operations in the current pass.
    pub total: usize,
    /// Operations still in the queue.
    pub pending_count: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Recent error strings, newest last.
    pub errors: Vec<String>,
}

impl SyncState {
    /// Create an idle state.
    pub fn new() -> Self {
        Self {
            is_online: false,
            is_syncing: false,
            phase: SyncPhase::Idle,
            progress_percent: 0,
            processed: 0,
            total: 0,
            pending_count: 0,
            last_sync_time: None,
            errors: Vec::new(),
        }
    }

    /// Whether any mutation has not reached the remote yet.
    pub fn has_pending_changes(&self) -> bool {
        self.pending_count > 0
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((processed.min(total) * 100) / total) as u8
}

/// Single writer of [`SyncState`].
pub struct StatePublisher {
    tx: watch::Sender<SyncState>,
    errors: std::sync::Mutex<VecDeque<String>>,
    max_errors: usize,
}

impl StatePublisher {
    /// Create a publisher keeping at most `max_errors` error strings.
    pub fn new(max_errors: usize) -> Self {
        let (tx, _) = watch::channel(SyncState::new());
        Self {
            tx,
            errors: std::sync::Mutex::new(VecDeque::new()),
            max_errors: max_errors.max(1),
        }
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }

    /// Current state.
    pub fn current(&self) -> SyncState {
        self.tx.borrow().clone()
    }

    /// Apply a change and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut SyncState)) {
        self.tx.send_modify(|state| {
            f(state);
            state.progress_percent = percent(state.processed, state.total);
        });
    }

    /// Append to the bounded error list, dropping the oldest entry when full.
    pub fn push_error(&self, message: impl Into<String>) {
        let snapshot = match self.errors.lock() {
            Ok(mut errors) => {
                errors.push_back(message.into());
                while errors.len() > self.max_errors {
                    errors.pop_front();
                }
                errors.iter().cloned().collect::<Vec<_>>()
            }
            Err(_) => return,
        };
        self.tx.send_modify(|state| state.errors = snapshot);
    }

    /// Forget recorded errors.
    pub fn clear_errors(&self) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.clear();
        }
        self.tx.send_modify(|state| state.errors.clear());
    }

    /// Record the network status.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.is_online != online;
            state.is_online = online;
            changed
        });
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ERRORS)
    }
}

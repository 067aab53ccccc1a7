//! ShopSync Sync Engine
//!
//! This module turns the local queue of mutations into remote writes:
//! - Debounced connectivity tracking
//! - Ordered, single-flight drains with per-operation outcomes
//! - Duplicate prevention through idempotency keys
//! - Conflict detection and resolution
//! - Retry with exponential backoff
//! - Background scheduling and the application-facing [`ShopSync`] handle

pub mod client;
pub mod config;
pub mod conflict;
pub mod dedup;
pub mod engine;
pub mod network;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use client::ShopSync;
pub use config::{ShopSyncConfig, CONFIG_FILENAME, DATABASE_FILENAME};
pub use conflict::{
    ConflictConfig, ConflictId, ConflictRecord, ConflictResolver, LocalWins, MergePolicy,
    MergePolicyKind, RemoteWins, Resolution,
};
pub use dedup::{DedupConfig, DedupGuard, FallbackRule, ReconcileReport};
pub use engine::{DrainReport, SkipReason, SyncEngine};
pub use network::{ConnectivityProbe, NetworkConfig, NetworkMonitor, RemoteProbe};
pub use retry::RetryConfig;
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{StatePublisher, SyncPhase, SyncState};

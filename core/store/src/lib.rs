//! Durable local state for ShopSync.
//!
//! This crate owns everything the application can do without a network:
//! the key-value persistence backend, the local record store, the field
//! normalizer applied at the store boundary, and the sync queue of pending
//! remote mutations.
//!
//! # Design Principles
//! - Synchronous API: store and queue calls never yield
//! - Atomic batches: a record write and its queue entry commit together
//! - One canonical shape: only the normalizer knows the remote naming

pub mod backend;
pub mod local;
pub mod normalize;
pub mod queue;
pub mod sqlite;

pub use backend::{KvBackend, MemoryBackend, WriteBatch, WriteOp};
pub use local::{LocalStore, RemoteBinding};
pub use normalize::FieldNormalizer;
pub use queue::{
    BackoffOutcome, OperationStatus, SyncOperation, SyncQueue, TerminalFailure,
    DEFAULT_MAX_ATTEMPTS,
};
pub use sqlite::SqliteBackend;

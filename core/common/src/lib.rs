//! Common utilities and types shared across the ShopSync crates.
//!
//! This module provides the error taxonomy, the domain identifiers and the
//! canonical record shape that every other crate works in.

pub mod error;
pub mod record;
pub mod types;

pub use error::{ConflictSignal, Error, ErrorClass, Result};
pub use record::{Fields, LocalRecord};
pub use types::{EntityType, MutationKind, OperationId, Priority, RecordId};

//! Common error types for ShopSync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Fields;
use crate::types::EntityType;

/// Structured conflict signal returned by a remote system when its copy of a
/// record changed since the version the client last observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSignal {
    /// Collection of the conflicting record.
    pub entity: EntityType,
    /// Remote identifier of the conflicting record.
    pub remote_id: String,
    /// Version the remote currently holds.
    pub remote_version: Option<DateTime<Utc>>,
    /// Remote copy of the record, in remote field naming.
    pub remote: Fields,
}

/// Top-level error type for ShopSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence failed (corruption, quota, locking).
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Network-level failure talking to the remote system.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote system is temporarily unavailable (5xx, maintenance).
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    /// The remote system rejected the payload.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The remote copy diverged from the client's last known version.
    #[error("Conflict on {} {}", .0.entity, .0.remote_id)]
    Conflict(Box<ConflictSignal>),
}

/// How the sync engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Retried with attempt counting.
    Transient,
    /// Terminal immediately, never retried.
    Validation,
    /// Routed to the conflict resolver.
    Conflict,
    /// Local failure surfaced synchronously to the caller.
    Fatal,
}

impl Error {
    /// Classify this error for retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Network(_) | Error::Timeout(_) | Error::Unavailable(_) => ErrorClass::Transient,
            Error::Validation(_)
            | Error::InvalidInput(_)
            | Error::Serialization(_)
            | Error::AlreadyExists(_) => ErrorClass::Validation,
            Error::Conflict(_) => ErrorClass::Conflict,
            Error::Storage(_) | Error::Io(_) | Error::NotFound(_) => ErrorClass::Fatal,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Build a conflict error from its parts.
    pub fn conflict(signal: ConflictSignal) -> Self {
        Error::Conflict(Box::new(signal))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(Error::Network("reset".into()).class(), ErrorClass::Transient);
        assert_eq!(Error::Timeout("10s".into()).class(), ErrorClass::Transient);
        assert_eq!(Error::Unavailable("503".into()).class(), ErrorClass::Transient);
        assert_eq!(Error::Validation("bad".into()).class(), ErrorClass::Validation);
        assert_eq!(Error::Storage("locked".into()).class(), ErrorClass::Fatal);

        let signal = ConflictSignal {
            entity: EntityType::Customer,
            remote_id: "r1".into(),
            remote_version: None,
            remote: Fields::new(),
        };
        let err = Error::conflict(signal);
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Conflict on customers r1");
    }
}

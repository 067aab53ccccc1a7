//! Canonical local record shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::RecordId;

/// Domain fields of a record, keyed by field name.
pub type Fields = serde_json::Map<String, Value>;

/// Versioned local copy of a domain entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    /// Local identifier, immutable once assigned.
    pub id: RecordId,
    /// Domain fields in canonical (camelCase) naming.
    pub fields: Fields,
    /// Last local modification.
    pub updated_at: DateTime<Utc>,
    /// Identifier assigned by the remote system once creation is confirmed.
    #[serde(default)]
    pub remote_id: Option<String>,
    /// Remote version last observed for this record.
    #[serde(default)]
    pub remote_version: Option<DateTime<Utc>>,
}

impl LocalRecord {
    /// Create a record that has never been seen by the remote system.
    pub fn new(id: RecordId, fields: Fields) -> Self {
        Self {
            id,
            fields,
            updated_at: Utc::now(),
            remote_id: None,
            remote_version: None,
        }
    }

    /// Get a single field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Shallow-apply a partial update. `null` values are kept, not removed.
    pub fn apply_patch(&mut self, patch: &Fields) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
        self.updated_at = Utc::now();
    }

    /// Whether the remote system has confirmed this record.
    pub fn is_synced_once(&self) -> bool {
        self.remote_id.is_some()
    }
}

//! Remote system trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shopsync_common::{EntityType, Error, Fields, Result};

/// Column holding the remote-assigned identifier.
pub const ID_COLUMN: &str = "id";
/// Column holding the client-minted idempotency key.
pub const IDEMPOTENCY_COLUMN: &str = "idempotency_key";
/// Column holding the row version used for conflict detection.
pub const VERSION_COLUMN: &str = "updated_at";
/// Column holding the row's creation timestamp.
pub const CREATED_COLUMN: &str = "created_at";

/// A row as the remote system stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Remote-assigned identifier.
    pub remote_id: String,
    /// Domain columns, snake_case, without the bookkeeping columns.
    pub fields: Fields,
    /// Idempotency key, if the backend persists it.
    pub idempotency_key: Option<String>,
    /// Row version; changes on every write.
    pub updated_at: DateTime<Utc>,
}

impl RemoteRecord {
    /// When the row was created, falling back to its version.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.fields
            .get(CREATED_COLUMN)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(self.updated_at)
    }

    /// Parse a full wire row into a record.
    pub fn from_row(mut row: Fields) -> Result<Self> {
        let remote_id = match row.remove(ID_COLUMN) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(Error::Serialization(
                    "Remote row is missing its id".to_string(),
                ))
            }
        };

        let idempotency_key = match row.remove(IDEMPOTENCY_COLUMN) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        let updated_at = row
            .remove(VERSION_COLUMN)
            .and_then(|v| v.as_str().map(str::to_string))
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| Error::Serialization(format!("Bad {}: {}", VERSION_COLUMN, e)))
            })
            .transpose()?
            .unwrap_or_else(Utc::now);

        Ok(Self {
            remote_id,
            fields: row,
            idempotency_key,
            updated_at,
        })
    }

    /// Render the record as a full wire row.
    pub fn to_row(&self) -> Fields {
        let mut row = self.fields.clone();
        row.insert(ID_COLUMN.to_string(), Value::String(self.remote_id.clone()));
        if let Some(key) = &self.idempotency_key {
            row.insert(IDEMPOTENCY_COLUMN.to_string(), Value::String(key.clone()));
        }
        row.insert(
            VERSION_COLUMN.to_string(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        row
    }
}

/// Strip bookkeeping columns a client must never set directly.
pub fn domain_columns(mut fields: Fields) -> Fields {
    fields.remove(ID_COLUMN);
    fields.remove(IDEMPOTENCY_COLUMN);
    fields.remove(VERSION_COLUMN);
    fields
}

/// The system of record the sync engine applies mutations to.
///
/// All payloads use remote (snake_case) naming. Implementations report a
/// version mismatch on update as `Error::Conflict`, a rejected payload as
/// `Error::Validation`, and retryable failures as `Error::Network`,
/// `Error::Timeout` or `Error::Unavailable`.
#[async_trait]
pub trait RemoteSystem: Send + Sync {
    /// Get the adapter name (e.g., "memory", "file", "rest").
    fn name(&self) -> &str;

    /// Insert a row and return it with its remote id.
    ///
    /// # Postconditions
    /// - The idempotency key is stored with the row if the backend supports it
    async fn create(
        &self,
        entity: EntityType,
        fields: Fields,
        idempotency_key: Option<&str>,
    ) -> Result<RemoteRecord>;

    /// Patch a row.
    ///
    /// # Errors
    /// - `Conflict` if `expected_version` is set and the row moved on since
    /// - `NotFound` if the row does not exist
    async fn update(
        &self,
        entity: EntityType,
        remote_id: &str,
        patch: Fields,
        expected_version: Option<DateTime<Utc>>,
    ) -> Result<RemoteRecord>;

    /// Delete a row.
    ///
    /// # Errors
    /// - `NotFound` if the row does not exist
    async fn delete(&self, entity: EntityType, remote_id: &str) -> Result<()>;

    /// Fetch a row by remote id.
    async fn get(&self, entity: EntityType, remote_id: &str) -> Result<Option<RemoteRecord>>;

    /// Find the row created with an idempotency key.
    async fn find_by_idempotency_key(
        &self,
        entity: EntityType,
        key: &str,
    ) -> Result<Option<RemoteRecord>>;

    /// List every row of a collection.
    async fn list(&self, entity: EntityType) -> Result<Vec<RemoteRecord>>;

    /// Cheap reachability check used by connectivity probes.
    async fn ping(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_round_trip() {
        let row = json!({
            "id": "r1",
            "idempotency_key": "k1",
            "updated_at": "2024-01-15T12:00:00Z",
            "total": 500
        });
        let record = RemoteRecord::from_row(row.as_object().cloned().unwrap()).unwrap();

        assert_eq!(record.remote_id, "r1");
        assert_eq!(record.idempotency_key.as_deref(), Some("k1"));
        assert_eq!(record.fields.len(), 1);
        assert_eq!(record.to_row()["total"], 500);
    }

    #[test]
    fn test_numeric_id_and_missing_id() {
        let record =
            RemoteRecord::from_row(json!({"id": 42}).as_object().cloned().unwrap()).unwrap();
        assert_eq!(record.remote_id, "42");

        assert!(RemoteRecord::from_row(Fields::new()).is_err());
    }

    #[test]
    fn test_created_at_prefers_column() {
        let record = RemoteRecord::from_row(
            json!({
                "id": "r1",
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-02-01T00:00:00Z"
            })
            .as_object()
            .cloned()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(record.created_at().to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_domain_columns_strips_bookkeeping() {
        let fields = domain_columns(
            json!({"id": "x", "idempotency_key": "k", "updated_at": "t", "debt": 1})
                .as_object()
            .cloned()
            .unwrap(),
        );
        assert_eq!(fields.len(), 1);
        assert!(fields.contains_key("debt"));
    }
}

//! Conflict records and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use shopsync_common::{EntityType, Error, Fields, OperationId, RecordId, Result};

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Re-send the local mutation over the remote copy.
    Local,
    /// Adopt the remote copy and drop the local mutation.
    Remote,
    /// Send a field-level union of both sides.
    Merge,
    /// Not resolved yet.
    Pending,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merge => "merge",
            Resolution::Pending => "pending",
        };
        f.write_str(name)
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Resolution::Local),
            "remote" => Ok(Resolution::Remote),
            "merge" => Ok(Resolution::Merge),
            "pending" => Ok(Resolution::Pending),
            other => Err(Error::InvalidInput(format!("Unknown resolution: {}", other))),
        }
    }
}

/// Identifier of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("Invalid conflict id {}: {}", s, e)))
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A queued mutation the remote refused because its copy moved on.
///
/// Both payloads are in canonical naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub entity: EntityType,
    pub record_id: RecordId,
    pub operation_id: OperationId,
    pub remote_id: String,
    pub local_payload: Fields,
    pub remote_payload: Fields,
    pub remote_version: Option<DateTime<Utc>>,
    pub resolution: Resolution,
    pub detected_at: DateTime<Utc>,
}

/// Field precedence for [`Resolution::Merge`].
pub trait MergePolicy: Send + Sync {
    /// Combine both sides into one payload.
    fn merge(&self, local: &Fields, remote: &Fields) -> Fields;
}

/// Remote value wins on key collision.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl MergePolicy for RemoteWins {
    fn merge(&self, local: &Fields, remote: &Fields) -> Fields {
        let mut merged = local.clone();
        merged.extend(remote.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Local value wins on key collision.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl MergePolicy for LocalWins {
    fn merge(&self, local: &Fields, remote: &Fields) -> Fields {
        let mut merged = remote.clone();
        merged.extend(local.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Configurable merge precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicyKind {
    #[default]
    RemoteWins,
    LocalWins,
}

impl MergePolicyKind {
    pub fn build(self) -> Arc<dyn MergePolicy> {
        match self {
            MergePolicyKind::RemoteWins => Arc::new(RemoteWins),
            MergePolicyKind::LocalWins => Arc::new(LocalWins),
        }
    }
}

/// Conflict settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Resolution applied without asking; `None` parks conflicts.
    pub auto_resolve: Option<Resolution>,
    pub merge_policy: MergePolicyKind,
}

/// Turns a conflict and a choice into the payload to keep.
pub struct ConflictResolver {
    policy: Arc<dyn MergePolicy>,
}

impl ConflictResolver {
    /// Create a resolver with a merge policy.
    pub fn new(policy: Arc<dyn MergePolicy>) -> Self {
        Self { policy }
    }

    /// Resolved payload, or `None` while the choice is `Pending`.
    pub fn resolve(&self, conflict: &ConflictRecord, choice: Resolution) -> Option<Fields> {
        match choice {
            Resolution::Local => Some(conflict.local_payload.clone()),
            Resolution::Remote => Some(conflict.remote_payload.clone()),
            Resolution::Merge => Some(
                self.policy
                    .merge(&conflict.local_payload, &conflict.remote_payload),
            ),
            Resolution::Pending => None,
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(Arc::new(RemoteWins))
    }
}

//! Duplicate prevention for creates.
//!
//! The primary check looks the operation's idempotency key up remotely. The
//! fallback exists for rows written by clients or schemas that never stored
//! a key: it matches natural-key columns, the amount column, and a creation
//! time within a tolerance window. It is a heuristic. Two genuinely separate
//! sales to the same customer for the same amount inside the window are
//! indistinguishable from a retry, which is why it can be switched off.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use shopsync_common::{EntityType, Error, Fields, Result};
use shopsync_remote::provider::CREATED_COLUMN;
use shopsync_remote::{RemoteRecord, RemoteSystem};
use shopsync_store::SyncOperation;

/// Fallback matching rule for one collection. Column names are remote names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackRule {
    pub natural_keys: Vec<String>,
    pub amount_field: Option<String>,
}

impl FallbackRule {
    fn is_empty(&self) -> bool {
        self.natural_keys.is_empty() && self.amount_field.is_none()
    }
}

/// Deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Whether rows without an idempotency key may be matched heuristically.
    pub fallback_enabled: bool,
    /// Maximum creation-time distance for a fallback match, in seconds.
    pub tolerance_secs: i64,
    pub rules: BTreeMap<EntityType, FallbackRule>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        let rule = |keys: &[&str], amount: Option<&str>| FallbackRule {
            natural_keys: keys.iter().map(|k| k.to_string()).collect(),
            amount_field: amount.map(str::to_string),
        };

        let mut rules = BTreeMap::new();
        rules.insert(EntityType::Sale, rule(&["customer_id"], Some("total")));
        rules.insert(
            EntityType::Transaction,
            rule(&["customer_id", "type"], Some("amount")),
        );
        rules.insert(EntityType::Customer, rule(&["name", "phone"], None));
        rules.insert(EntityType::Product, rule(&["name"], None));

        Self {
            fallback_enabled: true,
            tolerance_secs: 60,
            rules,
        }
    }
}

/// Result of a reconciliation pass over one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub entity: Option<EntityType>,
    pub scanned: usize,
    pub duplicate_groups: usize,
    pub duplicates_removed: usize,
    /// `(removed remote id, kept remote id)` pairs.
    pub replacements: Vec<(String, String)>,
}

/// Answers whether a create already reached the remote.
pub struct DedupGuard {
    remote: Arc<dyn RemoteSystem>,
    config: DedupConfig,
}

impl DedupGuard {
    pub fn new(remote: Arc<dyn RemoteSystem>, config: DedupConfig) -> Self {
        Self { remote, config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Find the remote row a create already produced.
    ///
    /// `payload` is the operation's payload in remote naming.
    pub async fn exists_remotely(
        &self,
        op: &SyncOperation,
        payload: &Fields,
    ) -> Result<Option<RemoteRecord>> {
        let key = op.operation_id.idempotency_key();
        if let Some(found) = self.remote.find_by_idempotency_key(op.entity, &key).await? {
            debug!("Operation {} already applied as {}", key, found.remote_id);
            return Ok(Some(found));
        }

        if !self.config.fallback_enabled {
            return Ok(None);
        }
        let rule = match self.config.rules.get(&op.entity) {
            Some(rule) if !rule.is_empty() => rule,
            _ => return Ok(None),
        };

        let at = payload_time(payload).unwrap_or(op.created_at);
        let tolerance = ChronoDuration::seconds(self.config.tolerance_secs.max(0));

        let mut candidates: Vec<RemoteRecord> = self
            .remote
            .list(op.entity)
            .await?
            .into_iter()
            .filter(|row| row.idempotency_key.is_none())
            .filter(|row| {
                let distance = row.created_at() - at;
                distance <= tolerance && distance >= -tolerance
            })
            .filter(|row| matches_rule(rule, payload, &row.fields))
            .collect();
        candidates.sort_by_key(|row| row.created_at());

        let found = candidates.into_iter().next();
        if let Some(row) = &found {
            info!(
                "Heuristic match for {} {}: remote {}",
                op.entity, op.record_id, row.remote_id
            );
        }
        Ok(found)
    }

    /// Delete all but the earliest row of every idempotency-key group.
    pub async fn reconcile(&self, entity: EntityType) -> Result<ReconcileReport> {
        let rows = self.remote.list(entity).await?;
        let mut report = ReconcileReport {
            entity: Some(entity),
            scanned: rows.len(),
            ..ReconcileReport::default()
        };

        let mut groups: HashMap<String, Vec<RemoteRecord>> = HashMap::new();
        for row in rows {
            if let Some(key) = row.idempotency_key.clone() {
                groups.entry(key).or_default().push(row);
            }
        }

        for (key, mut group) in groups {
            if group.len() < 2 {
                continue;
            }
            report.duplicate_groups += 1;
            group.sort_by(|a, b| {
                a.created_at()
                    .cmp(&b.created_at())
                    .then_with(|| a.remote_id.cmp(&b.remote_id))
            });

            let kept = group.remove(0);
            for duplicate in group {
                match self.remote.delete(entity, &duplicate.remote_id).await {
                    Ok(()) | Err(Error::NotFound(_)) => {
                        report.duplicates_removed += 1;
                        report
                            .replacements
                            .push((duplicate.remote_id, kept.remote_id.clone()));
                    }
                    Err(e) => {
                        warn!(
                            "Failed to remove duplicate {} of {}: {}",
                            duplicate.remote_id, key, e
                        );
                        return Err(e);
                    }
                }
            }
        }

        info!(
            "Reconciled {}: {} duplicate(s) removed",
            entity, report.duplicates_removed
        );
        Ok(report)
    }
}

fn payload_time(payload: &Fields) -> Option<DateTime<Utc>> {
    payload
        .get(CREATED_COLUMN)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < 1e-9,
        _ => a == b,
    }
}

/// Absent and null compare equal; at least one rule column must carry a value.
fn matches_rule(rule: &FallbackRule, payload: &Fields, row: &Fields) -> bool {
    let mut anchored = false;
    for column in rule.natural_keys.iter().chain(rule.amount_field.iter()) {
        let ours = payload.get(column).unwrap_or(&Value::Null);
        let theirs = row.get(column).unwrap_or(&Value::Null);
        if !same_value(ours, theirs) {
            return false;
        }
        anchored |= !ours.is_null();
    }
    anchored
}

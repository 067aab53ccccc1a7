//! ShopSync configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use shopsync_common::{EntityType, Error, Priority, Result};
use shopsync_store::{FieldNormalizer, DEFAULT_MAX_ATTEMPTS};

use crate::conflict::ConflictConfig;
use crate::dedup::DedupConfig;
use crate::network::NetworkConfig;
use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;
use crate::state::DEFAULT_MAX_ERRORS;

/// Configuration file name in the data directory.
pub const CONFIG_FILENAME: &str = "shopsync.json";

/// Database file name in the data directory.
pub const DATABASE_FILENAME: &str = "shopsync.db";

/// Complete configuration of a [`crate::ShopSync`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShopSyncConfig {
    /// Attempts before a transiently failing operation is evicted.
    pub max_attempts: u32,
    /// Deadline for every remote call, in milliseconds.
    pub remote_timeout_ms: u64,
    pub retry: RetryConfig,
    pub network: NetworkConfig,
    pub dedup: DedupConfig,
    pub conflict: ConflictConfig,
    pub sync_mode: SyncMode,
    /// Capacity of the recent error list in the sync state.
    pub max_errors: usize,
    /// Field renames beyond case conversion.
    pub normalizer: FieldNormalizer,
    /// Queue priority per collection.
    pub priorities: BTreeMap<EntityType, Priority>,
    /// Remote adapter type (e.g., "memory", "file", "rest").
    pub provider_type: String,
    /// Adapter-specific configuration.
    pub provider_config: serde_json::Value,
}

impl ShopSyncConfig {
    /// Remote call deadline.
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Queue priority of a collection.
    pub fn priority_of(&self, entity: EntityType) -> Priority {
        self.priorities.get(&entity).copied().unwrap_or_default()
    }

    /// Check values that would otherwise fail later.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.remote_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "remote_timeout_ms must be positive".to_string(),
            ));
        }
        if self.provider_type.trim().is_empty() {
            return Err(Error::InvalidInput("provider_type is empty".to_string()));
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ShopSyncConfig {
    fn default() -> Self {
        let mut priorities = BTreeMap::new();
        priorities.insert(EntityType::Sale, Priority::High);
        priorities.insert(EntityType::Transaction, Priority::High);
        priorities.insert(EntityType::Customer, Priority::Medium);
        priorities.insert(EntityType::Product, Priority::Low);

        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            remote_timeout_ms: 10_000,
            retry: RetryConfig::default(),
            network: NetworkConfig::default(),
            dedup: DedupConfig::default(),
            conflict: ConflictConfig::default(),
            sync_mode: SyncMode::Manual,
            max_errors: DEFAULT_MAX_ERRORS,
            normalizer: FieldNormalizer::default(),
            priorities,
            provider_type: "memory".to_string(),
            provider_config: serde_json::Value::Null,
        }
    }
}

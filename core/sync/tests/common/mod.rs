#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use shopsync_common::Fields;
use shopsync_remote::MemoryRemote;
use shopsync_sync::{NetworkConfig, RetryConfig, ShopSync, ShopSyncConfig, SyncState};

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}

/// No connectivity probe and no backoff delay; tests drive both explicitly.
pub fn config() -> ShopSyncConfig {
    ShopSyncConfig {
        retry: RetryConfig::immediate(),
        network: NetworkConfig {
            probe_interval_ms: 0,
            ..NetworkConfig::default()
        },
        ..ShopSyncConfig::default()
    }
}

/// Open an in-memory instance and wait until the startup drain is done.
pub async fn start(remote: Arc<MemoryRemote>, config: ShopSyncConfig) -> ShopSync {
    let sync = ShopSync::in_memory(config, remote).await.unwrap();
    sync.force_sync().await.unwrap();
    sync
}

pub async fn wait_until(sync: &ShopSync, pred: impl Fn(&SyncState) -> bool) {
    let mut rx = sync.subscribe_state();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for sync state")
        .expect("state channel closed");
}

pub async fn wait_until_drained(sync: &ShopSync) {
    wait_until(sync, |s| s.pending_count == 0 && !s.is_syncing).await;
}

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use shopsync_common::{EntityType, MutationKind, RecordId};
use shopsync_remote::{MemoryRemote, RemoteSystem};
use shopsync_store::OperationStatus;
use shopsync_sync::{ShopSync, ShopSyncConfig, SkipReason, SyncMode};

use common::{config, fields, start, wait_until, wait_until_drained};

#[tokio::test]
async fn queue_survives_restart_and_recovers_in_flight_operations() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("shopsync.db");
    let remote = Arc::new(MemoryRemote::new());
    remote.set_online(false);

    {
        let sync = ShopSync::open(&db, config(), remote.clone()).await.unwrap();
        sync.create(
            EntityType::Product,
            RecordId::new("p1").unwrap(),
            fields(json!({"name": "Rice"})),
        )
        .unwrap();
        sync.create(EntityType::Sale, RecordId::new("s1").unwrap(), fields(json!({"total": 9})))
            .unwrap();
        sync.update(
            EntityType::Product,
            &RecordId::new("p1").unwrap(),
            fields(json!({"unitPrice": 4})),
        )
        .unwrap();

        // Simulate a crash in the middle of applying the first operation.
        let first = sync.queued().unwrap().remove(0);
        sync.engine()
            .queue()
            .mark(&first.operation_id, OperationStatus::InFlight)
            .unwrap();
        sync.shutdown().await;
    }

    remote.set_online(true);
    let sync = ShopSync::open(&db, config(), remote.clone()).await.unwrap();

    let queued = sync.queued().unwrap();
    assert_eq!(queued.len(), 3);
    assert!(queued.iter().all(|op| op.status == OperationStatus::Pending));
    assert_eq!(queued[0].record_id.as_str(), "p1");
    assert_eq!(queued[1].record_id.as_str(), "s1");
    assert_eq!(queued[2].kind, MutationKind::Update);

    wait_until_drained(&sync).await;

    assert_eq!(remote.rows(EntityType::Sale).unwrap().len(), 1);
    let products = remote.rows(EntityType::Product).unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].fields["unit_price"], 4);

    let local = sync
        .get(EntityType::Product, &RecordId::new("p1").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(local.remote_id.as_deref(), Some(products[0].remote_id.as_str()));

    sync.shutdown().await;
}

#[tokio::test]
async fn concurrent_drains_are_single_flight() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;
    sync.create(EntityType::Sale, RecordId::new("s1").unwrap(), fields(json!({"total": 1})))
        .unwrap();
    remote.set_latency(Some(Duration::from_millis(50)));

    let engine = sync.engine().clone();
    let (a, b) = tokio::join!(engine.drain(), engine.drain());
    let reports = [a.unwrap(), b.unwrap()];

    assert_eq!(
        reports
            .iter()
            .filter(|r| r.skipped == Some(SkipReason::AlreadyDraining))
            .count(),
        1
    );
    assert_eq!(reports.iter().map(|r| r.acknowledged).sum::<usize>(), 1);
    assert_eq!(remote.create_calls(), 1);

    sync.shutdown().await;
}

#[tokio::test]
async fn force_sync_during_a_running_pass_is_skipped() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;
    sync.create(EntityType::Sale, RecordId::new("s1").unwrap(), fields(json!({"total": 1})))
        .unwrap();
    remote.set_latency(Some(Duration::from_millis(100)));

    let (first, second) = tokio::join!(sync.force_sync(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sync.engine().is_draining());
        sync.force_sync().await
    });
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(second.skipped, Some(SkipReason::AlreadyDraining));
    assert_eq!(second.total, 0);
    assert_eq!(first.skipped, None);
    assert_eq!(first.acknowledged, 1);
    assert_eq!(remote.create_calls(), 1);

    // No second pass was queued behind the first.
    remote.set_latency(None);
    let report = sync.force_sync().await.unwrap();
    assert_eq!(report.total, 0);
    assert_eq!(remote.create_calls(), 1);

    sync.shutdown().await;
}

#[tokio::test]
async fn writes_during_a_pass_are_not_lost() {
    let remote = Arc::new(MemoryRemote::new());
    let config = ShopSyncConfig {
        sync_mode: SyncMode::OnDemand,
        ..config()
    };
    let sync = start(remote.clone(), config).await;
    remote.set_latency(Some(Duration::from_millis(50)));

    sync.create(EntityType::Sale, RecordId::new("s1").unwrap(), fields(json!({"total": 1})))
        .unwrap();
    wait_until(&sync, |s| s.is_syncing).await;
    for id in ["s2", "s3", "s4"] {
        sync.create(EntityType::Sale, RecordId::new(id).unwrap(), fields(json!({"total": 2})))
            .unwrap();
    }
    wait_until_drained(&sync).await;

    assert_eq!(remote.rows(EntityType::Sale).unwrap().len(), 4);
    assert_eq!(remote.create_calls(), 4);
    sync.shutdown().await;
}

#[tokio::test]
async fn cancelled_drain_stops_between_operations() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;
    for id in ["p1", "p2", "p3"] {
        sync.create(EntityType::Product, RecordId::new(id).unwrap(), fields(json!({"name": id})))
            .unwrap();
    }
    remote.set_latency(Some(Duration::from_millis(50)));

    let token = CancellationToken::new();
    let engine = sync.engine().clone();
    let (report, _) = tokio::join!(engine.drain_with(&token), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    });
    let report = report.unwrap();

    assert!(report.interrupted);
    assert_eq!(report.acknowledged, 1);
    assert_eq!(sync.pending_count().unwrap(), 2);
    assert!(sync
        .queued()
        .unwrap()
        .iter()
        .all(|op| op.status == OperationStatus::Pending));
    assert!(!sync.state().is_syncing);

    sync.shutdown().await;
}

#[tokio::test]
async fn on_demand_mode_drains_after_each_write() {
    let remote = Arc::new(MemoryRemote::new());
    let config = ShopSyncConfig {
        sync_mode: SyncMode::OnDemand,
        ..config()
    };
    let sync = start(remote.clone(), config).await;

    sync.create(EntityType::Customer, RecordId::new("c1").unwrap(), fields(json!({"name": "Ana"})))
        .unwrap();
    wait_until_drained(&sync).await;

    assert_eq!(remote.rows(EntityType::Customer).unwrap().len(), 1);
    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn periodic_mode_drains_on_interval() {
    let remote = Arc::new(MemoryRemote::new());
    let config = ShopSyncConfig {
        sync_mode: SyncMode::Periodic { interval_secs: 5 },
        ..config()
    };
    let sync = start(remote.clone(), config).await;

    sync.create(EntityType::Product, RecordId::new("p1").unwrap(), fields(json!({"name": "Tea"})))
        .unwrap();
    assert!(remote.rows(EntityType::Product).unwrap().is_empty());

    wait_until_drained(&sync).await;
    assert_eq!(remote.rows(EntityType::Product).unwrap().len(), 1);

    sync.shutdown().await;
}

#[tokio::test]
async fn reconcile_removes_duplicates_and_rebinds_local_records() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;

    let kept = remote
        .create(EntityType::Sale, fields(json!({"total": 7})), Some("op-1"))
        .await
        .unwrap();
    let duplicate = remote
        .create(EntityType::Sale, fields(json!({"total": 7})), Some("op-1"))
        .await
        .unwrap();

    let id = RecordId::new("s1").unwrap();
    sync.import_remote(EntityType::Sale, id.clone(), duplicate.to_row())
        .unwrap();

    let reports = sync.reconcile(Some(EntityType::Sale)).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].duplicates_removed, 1);
    assert_eq!(
        reports[0].replacements,
        vec![(duplicate.remote_id.clone(), kept.remote_id.clone())]
    );

    let rows = remote.rows(EntityType::Sale).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].remote_id, kept.remote_id);

    let local = sync.get(EntityType::Sale, &id).unwrap().unwrap();
    assert_eq!(local.remote_id, Some(kept.remote_id));
    assert_eq!(local.fields["total"], 7);

    sync.shutdown().await;
}

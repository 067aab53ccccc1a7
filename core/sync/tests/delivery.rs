//! End-to-end delivery guarantees of the sync engine against a memory remote.

mod common;

use serde_json::json;
use std::sync::Arc;

use shopsync_common::{EntityType, Error, ErrorClass, RecordId};
use shopsync_remote::{Fault, MemoryRemote};

use common::{config, fields, start, wait_until_drained};

#[tokio::test(start_paused = true)]
async fn sale_recorded_offline_is_created_once_after_reconnect() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_online(false);
    let sync = start(remote.clone(), config()).await;
    assert!(!sync.state().is_online);

    let id = RecordId::new("s1").unwrap();
    sync.create(
        EntityType::Sale,
        id.clone(),
        fields(json!({
            "customerId": "c1",
            "total": 500,
            "items": [{"productId": "p1", "qty": 2}]
        })),
    )
    .unwrap();
    assert_eq!(sync.pending_count().unwrap(), 1);
    assert!(sync.get(EntityType::Sale, &id).unwrap().unwrap().remote_id.is_none());

    remote.set_online(true);
    sync.network().report(true);
    wait_until_drained(&sync).await;

    let rows = remote.rows(EntityType::Sale).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fields["total"], 500);
    assert_eq!(rows[0].fields["customer_id"], "c1");
    assert_eq!(rows[0].fields["items"][0]["product_id"], "p1");
    assert_eq!(remote.create_calls(), 1);

    let local = sync.get(EntityType::Sale, &id).unwrap().unwrap();
    assert_eq!(local.remote_id.as_deref(), Some(rows[0].remote_id.as_str()));
    assert!(sync.queued().unwrap().is_empty());
    assert!(sync.state().is_online);
    assert!(sync.state().last_sync_time.is_some());

    sync.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn offline_debt_updates_apply_in_order_without_conflict() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;

    let id = RecordId::new("c1").unwrap();
    sync.create(EntityType::Customer, id.clone(), fields(json!({"name": "Ana", "debt": 100})))
        .unwrap();
    assert_eq!(sync.force_sync().await.unwrap().acknowledged, 1);

    sync.network().report(false);
    sync.update(EntityType::Customer, &id, fields(json!({"debt": 150})))
        .unwrap();
    sync.update(EntityType::Customer, &id, fields(json!({"debt": 175})))
        .unwrap();
    let skipped = sync.force_sync().await.unwrap();
    assert!(skipped.is_skipped());

    sync.network().report(true);
    wait_until_drained(&sync).await;

    let rows = remote.rows(EntityType::Customer).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fields["debt"], 175);
    assert_eq!(rows[0].fields["name"], "Ana");
    assert!(sync.conflicts().unwrap().is_empty());

    let local = sync.get(EntityType::Customer, &id).unwrap().unwrap();
    assert_eq!(local.fields["debt"], 175);
    assert_eq!(local.remote_version, Some(rows[0].updated_at));

    sync.shutdown().await;
}

#[tokio::test]
async fn lost_acknowledgement_is_not_replayed() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;
    remote
        .push_fault(Fault::ApplyThenFail(Error::Network("connection reset".into())))
        .unwrap();

    sync.create(EntityType::Sale, RecordId::new("s1").unwrap(), fields(json!({"total": 80})))
        .unwrap();

    let first = sync.force_sync().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(remote.rows(EntityType::Sale).unwrap().len(), 1);

    let second = sync.force_sync().await.unwrap();
    assert_eq!(second.deduplicated, 1);
    assert_eq!(remote.rows(EntityType::Sale).unwrap().len(), 1);
    assert_eq!(remote.create_calls(), 1);
    assert_eq!(sync.pending_count().unwrap(), 0);

    sync.shutdown().await;
}

#[tokio::test]
async fn lost_acknowledgement_without_stored_keys_uses_fallback_match() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_persist_idempotency_keys(false);
    let sync = start(remote.clone(), config()).await;
    remote
        .push_fault(Fault::ApplyThenFail(Error::Timeout("gateway".into())))
        .unwrap();

    let id = RecordId::new("s1").unwrap();
    sync.create(EntityType::Sale, id.clone(), fields(json!({"customerId": "c1", "total": 500})))
        .unwrap();

    assert_eq!(sync.force_sync().await.unwrap().retried, 1);
    let report = sync.force_sync().await.unwrap();
    assert_eq!(report.deduplicated, 1);

    let rows = remote.rows(EntityType::Sale).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        sync.get(EntityType::Sale, &id).unwrap().unwrap().remote_id,
        Some(rows[0].remote_id.clone())
    );

    sync.shutdown().await;
}

#[tokio::test]
async fn exhausted_attempts_move_operation_to_failure_log() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;
    for _ in 0..3 {
        remote
            .push_fault(Fault::Fail(Error::Unavailable("503".into())))
            .unwrap();
    }

    let id = RecordId::new("p1").unwrap();
    sync.create(EntityType::Product, id.clone(), fields(json!({"name": "Flour"})))
        .unwrap();

    assert_eq!(sync.force_sync().await.unwrap().retried, 1);
    assert_eq!(sync.force_sync().await.unwrap().retried, 1);
    assert_eq!(sync.force_sync().await.unwrap().evicted, 1);

    assert_eq!(sync.pending_count().unwrap(), 0);
    let failures = sync.failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].class, ErrorClass::Transient);
    assert_eq!(failures[0].operation.attempts, 3);
    assert_eq!(failures[0].operation.record_id, id);
    assert_eq!(sync.state().errors.len(), 1);

    // The optimistic local copy is kept.
    assert!(sync.get(EntityType::Product, &id).unwrap().is_some());
    assert!(remote.rows(EntityType::Product).unwrap().is_empty());

    sync.clear_failures().unwrap();
    assert!(sync.failures().unwrap().is_empty());
    assert!(sync.state().errors.is_empty());

    sync.shutdown().await;
}

#[tokio::test]
async fn update_waits_for_failed_create_of_same_record() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;
    remote
        .push_fault(Fault::Fail(Error::Network("reset".into())))
        .unwrap();

    let id = RecordId::new("c1").unwrap();
    sync.create(EntityType::Customer, id.clone(), fields(json!({"name": "Ana", "debt": 100})))
        .unwrap();
    sync.update(EntityType::Customer, &id, fields(json!({"debt": 150})))
        .unwrap();

    let first = sync.force_sync().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(first.deferred, 1);
    assert!(remote.rows(EntityType::Customer).unwrap().is_empty());

    let second = sync.force_sync().await.unwrap();
    assert_eq!(second.acknowledged, 2);
    let rows = remote.rows(EntityType::Customer).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fields["debt"], 150);

    sync.shutdown().await;
}

#[tokio::test]
async fn update_of_rejected_create_is_evicted() {
    let remote = Arc::new(MemoryRemote::new());
    remote.require_column(EntityType::Customer, "phone");
    let sync = start(remote.clone(), config()).await;

    let id = RecordId::new("c1").unwrap();
    sync.create(EntityType::Customer, id.clone(), fields(json!({"name": "Ana"})))
        .unwrap();
    sync.update(EntityType::Customer, &id, fields(json!({"debt": 10})))
        .unwrap();

    let first = sync.force_sync().await.unwrap();
    assert_eq!(first.evicted, 1);
    assert_eq!(first.deferred, 1);

    let second = sync.force_sync().await.unwrap();
    assert_eq!(second.evicted, 1);

    let failures = sync.failures().unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.class == ErrorClass::Validation));
    assert_eq!(remote.create_calls(), 1);

    sync.shutdown().await;
}

#[tokio::test]
async fn higher_priority_collections_sync_first() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;

    sync.create(EntityType::Product, RecordId::new("p1").unwrap(), fields(json!({"name": "Salt"})))
        .unwrap();
    sync.create(EntityType::Customer, RecordId::new("c1").unwrap(), fields(json!({"name": "Ana"})))
        .unwrap();
    sync.create(EntityType::Sale, RecordId::new("s1").unwrap(), fields(json!({"total": 3})))
        .unwrap();

    assert_eq!(sync.force_sync().await.unwrap().acknowledged, 3);

    let sale = &remote.rows(EntityType::Sale).unwrap()[0];
    let customer = &remote.rows(EntityType::Customer).unwrap()[0];
    let product = &remote.rows(EntityType::Product).unwrap()[0];
    assert!(sale.updated_at < customer.updated_at);
    assert!(customer.updated_at < product.updated_at);

    sync.shutdown().await;
}

#[tokio::test]
async fn deleting_unsynced_record_sends_create_then_delete() {
    let remote = Arc::new(MemoryRemote::new());
    let sync = start(remote.clone(), config()).await;

    let id = RecordId::new("t1").unwrap();
    sync.create(
        EntityType::Transaction,
        id.clone(),
        fields(json!({"amount": 20, "type": "payment"})),
    )
    .unwrap();
    sync.delete(EntityType::Transaction, &id).unwrap();
    assert!(sync.get(EntityType::Transaction, &id).unwrap().is_none());

    let report = sync.force_sync().await.unwrap();
    assert_eq!(report.acknowledged, 2);
    assert!(remote.rows(EntityType::Transaction).unwrap().is_empty());
    assert_eq!(sync.pending_count().unwrap(), 0);

    sync.shutdown().await;
}

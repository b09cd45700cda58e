//! Distributed GC scenarios

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

use common::{TestCluster, wait_for_mode, wait_until};
use strata_engine::foundation::messages::{GcMessage, GcResult, GroupMessage};
use strata_engine::{ObjectId, ServerMode};
use strata_transport::GroupTransport;

#[tokio::test]
async fn test_gc_result_is_disseminated_and_applied_everywhere() {
    let cluster = TestCluster::new();
    let active = cluster.add_node(1, 30).await;
    wait_for_mode(&active, ServerMode::Active).await;
    active.objects.populate(10);

    let passive = cluster.add_node(2, 10).await;
    wait_for_mode(&passive, ServerMode::PassiveStandby).await;
    assert_eq!(passive.objects.object_count(), 10);

    active.objects.set_garbage([3, 7]);
    assert!(active.engine.start_gc_cycle().await.unwrap());

    wait_until("garbage removed everywhere", || {
        !active.objects.contains(ObjectId::new(3))
            && !passive.objects.contains(ObjectId::new(3))
            && !passive.objects.contains(ObjectId::new(7))
    })
    .await;
    assert_eq!(active.objects.object_count(), 8);
    assert_eq!(passive.objects.object_count(), 8);
}

#[tokio::test]
async fn test_stale_gc_result_is_a_no_op() {
    let cluster = TestCluster::new();
    let active = cluster.add_node(1, 30).await;
    wait_for_mode(&active, ServerMode::Active).await;
    active.objects.populate(50);

    let passive = cluster.add_node(2, 10).await;
    wait_for_mode(&passive, ServerMode::PassiveStandby).await;

    let observer = cluster.join_observer(9);
    let result = GroupMessage::Gc(GcMessage::Result(GcResult {
        iteration: 5,
        deleted: BTreeSet::from([ObjectId::new(17), ObjectId::new(42)]),
    }));

    // First application deletes; the repeat is a no-op, not an error
    for _ in 0..2 {
        observer
            .send_to(&passive.node_id, result.encode().unwrap(), result.kind())
            .await
            .unwrap();
    }

    wait_until("first result applied", || {
        !passive.objects.contains(ObjectId::new(17))
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(passive.objects.delete_calls.load(Ordering::SeqCst), 1);
    assert_eq!(passive.mode(), ServerMode::PassiveStandby);

    // An older iteration is equally inert
    let stale = GroupMessage::Gc(GcMessage::Result(GcResult {
        iteration: 4,
        deleted: BTreeSet::from([ObjectId::new(1)]),
    }));
    observer
        .send_to(&passive.node_id, stale.encode().unwrap(), stale.kind())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(passive.objects.contains(ObjectId::new(1)));
    assert_eq!(passive.objects.delete_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_active_ignores_foreign_gc_results() {
    let cluster = TestCluster::new();
    let active = cluster.add_node(1, 30).await;
    wait_for_mode(&active, ServerMode::Active).await;
    active.objects.populate(10);

    let observer = cluster.join_observer(9);
    let result = GroupMessage::Gc(GcMessage::Result(GcResult {
        iteration: 99,
        deleted: BTreeSet::from([ObjectId::new(1)]),
    }));
    observer
        .send_to(&active.node_id, result.encode().unwrap(), result.kind())
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(active.objects.contains(ObjectId::new(1)));
    assert_eq!(active.objects.delete_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_gc_is_refused_while_a_passive_syncs() {
    let cluster = TestCluster::new();
    let active = cluster.add_node(1, 30).await;
    wait_for_mode(&active, ServerMode::Active).await;
    active.objects.populate(20);
    active.objects.hold();

    let passive = cluster.add_node(2, 10).await;
    wait_for_mode(&passive, ServerMode::PassiveUninitialized).await;

    // Collection stays disabled for the whole sync
    assert!(!active.engine.start_gc_cycle().await.unwrap());

    active.objects.release();
    wait_for_mode(&passive, ServerMode::PassiveStandby).await;
    assert!(active.engine.start_gc_cycle().await.unwrap());
}

#[tokio::test]
async fn test_sync_requested_mid_cycle_is_deferred_until_it_ends() {
    let cluster = TestCluster::new();
    let active = cluster.add_node(1, 30).await;
    wait_for_mode(&active, ServerMode::Active).await;
    active.objects.populate(20);

    // Hold the cycle open at the quiesce point
    active.txns.set_manual_quiesce();
    assert!(active.engine.start_gc_cycle().await.unwrap());

    let passive = cluster.add_node(2, 10).await;
    wait_for_mode(&passive, ServerMode::PassiveUninitialized).await;

    // No sync traffic while the cycle runs
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(passive.objects.object_count(), 0);
    assert_eq!(passive.mode(), ServerMode::PassiveUninitialized);

    // Ending the cycle starts the deferred sync
    active.txns.fire_quiesce();
    wait_for_mode(&passive, ServerMode::PassiveStandby).await;
    assert_eq!(passive.objects.object_count(), 20);
}

//! Full-state synchronization scenarios

mod common;

use common::{TestCluster, wait_for_mode, wait_until};
use strata_engine::foundation::messages::{GroupMessage, ObjectSyncMessage};
use strata_engine::{ObjectId, ServerMode};
use strata_transport::GroupTransport;

#[tokio::test]
async fn test_full_object_and_index_sync_reaches_standby() {
    let cluster = TestCluster::new();
    let active = cluster
        .add_node_with(1, 30, |config| config.sync.batch_size = 500)
        .await;
    wait_for_mode(&active, ServerMode::Active).await;

    // 1200 objects means three batches at the default batch size
    active.objects.populate(1200);
    active.indexes.add_file("search", "segment-0", b"alpha");
    active.indexes.add_file("search", "segment-1", b"beta");

    let passive = cluster.add_node(2, 10).await;
    wait_for_mode(&passive, ServerMode::PassiveStandby).await;

    assert_eq!(passive.objects.object_count(), 1200);
    assert!(passive.objects.contains(ObjectId::new(0)));
    assert!(passive.objects.contains(ObjectId::new(1199)));
    assert_eq!(passive.indexes.applied_count(), 2);

    let applied = passive.indexes.applied.lock();
    assert!(applied.iter().any(|(_, f, b)| f == "segment-0" && b == "alpha"));
    assert!(applied.iter().any(|(_, f, b)| f == "segment-1" && b == "beta"));
}

#[tokio::test]
async fn test_standby_requires_index_sync_even_after_objects_finish() {
    let cluster = TestCluster::new();
    let active = cluster.add_node(1, 30).await;
    wait_for_mode(&active, ServerMode::Active).await;

    active.objects.populate(10);
    active.indexes.add_file("search", "segment-0", b"alpha");
    // Index reads stall, so only the object pipeline can complete
    active.indexes.hold();

    let passive = cluster.add_node(2, 10).await;
    wait_until("object sync to finish", || {
        passive.objects.object_count() == 10
    })
    .await;

    // Give the object completion ack time to land: still not standby
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(passive.mode(), ServerMode::PassiveUninitialized);

    active.indexes.release();
    wait_for_mode(&passive, ServerMode::PassiveStandby).await;
}

#[tokio::test]
async fn test_standby_requires_object_sync_even_after_indexes_finish() {
    let cluster = TestCluster::new();
    let active = cluster.add_node(1, 30).await;
    wait_for_mode(&active, ServerMode::Active).await;

    active.objects.populate(10);
    active.indexes.add_file("search", "segment-0", b"alpha");
    // Object dehydration stalls, so only the index pipeline can complete
    active.objects.hold();

    let passive = cluster.add_node(2, 10).await;
    wait_until("index sync to finish", || passive.indexes.applied_count() == 1).await;

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(passive.mode(), ServerMode::PassiveUninitialized);

    active.objects.release();
    wait_for_mode(&passive, ServerMode::PassiveStandby).await;
}

#[tokio::test]
async fn test_sync_batches_arrive_in_sequence_order() {
    let cluster = TestCluster::new();
    let active = cluster
        .add_node_with(1, 30, |config| config.sync.batch_size = 100)
        .await;
    wait_for_mode(&active, ServerMode::Active).await;
    active.objects.populate(500);

    let passive = cluster.add_node(2, 10).await;
    wait_for_mode(&passive, ServerMode::PassiveStandby).await;

    let sequences = passive.objects.applied_sequences.lock();
    assert!(!sequences.is_empty());
    for pair in sequences.windows(2) {
        assert!(pair[0] < pair[1], "sequences reordered: {sequences:?}");
    }
}

#[tokio::test]
async fn test_second_sync_request_is_refused() {
    let cluster = TestCluster::new();
    let active = cluster.add_node(1, 30).await;
    wait_for_mode(&active, ServerMode::Active).await;

    let passive = cluster.add_node(2, 10).await;
    wait_for_mode(&passive, ServerMode::PassiveStandby).await;

    // A second begin in the same incarnation must be refused
    let observer = cluster.join_observer(9);
    let mut incoming = observer.incoming();
    let begin = GroupMessage::ObjectSync(ObjectSyncMessage::Begin);
    observer
        .send_to(&passive.node_id, begin.encode().unwrap(), begin.kind())
        .await
        .unwrap();

    loop {
        let (sender, message) = common::next_message(&mut incoming).await;
        if let GroupMessage::ObjectSync(ObjectSyncMessage::BeginResponse {
            current_mode,
            sync_allowed,
        }) = message
        {
            assert_eq!(sender, passive.node_id);
            assert_eq!(current_mode, ServerMode::PassiveStandby);
            assert!(!sync_allowed);
            break;
        }
    }
}

#[tokio::test]
async fn test_departure_mid_sync_discards_the_context() {
    let cluster = TestCluster::new();
    let active = cluster.add_node(1, 30).await;
    wait_for_mode(&active, ServerMode::Active).await;
    active.objects.populate(50);
    active.objects.hold();

    let mut passive = cluster.add_node(2, 10).await;
    wait_for_mode(&passive, ServerMode::PassiveUninitialized).await;
    passive.engine.stop().await;

    // The active must release the GC interlock once the syncing node is
    // gone; a cycle can then start
    active.objects.release();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if active.engine.start_gc_cycle().await.unwrap() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "GC never re-enabled after mid-sync departure"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

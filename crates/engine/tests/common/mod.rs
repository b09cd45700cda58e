//! Test cluster utilities for integration testing

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use strata_engine::foundation::messages::{GroupMessage, IndexSyncFile, ObjectSyncBatch, RelayedCommitBatch};
use strata_engine::{
    ApplyMode, CommittedBatch, DehydratedBatch, Engine, EngineBuilder, EngineConfig, EngineResult,
    GlobalTransactionId, IndexFileRef, IndexSource, ObjectId, ObjectSource, ServerMode,
    ServerTransactionId, TransactionSystem,
};
use strata_topology::NodeId;
use strata_transport_memory::{MemoryGroup, MemoryGroupTransport};
use tokio::sync::Semaphore;

/// In-memory object graph engine
pub struct MockObjectStore {
    objects: DashMap<ObjectId, Bytes>,
    garbage: Mutex<BTreeSet<ObjectId>>,
    /// Sequence ids observed on applied sync batches
    pub applied_sequences: Mutex<Vec<u64>>,
    /// Number of delete_objects calls
    pub delete_calls: AtomicUsize,
    gated: AtomicBool,
    gate: Semaphore,
}

impl MockObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: DashMap::new(),
            garbage: Mutex::new(BTreeSet::new()),
            applied_sequences: Mutex::new(Vec::new()),
            delete_calls: AtomicUsize::new(0),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn populate(&self, count: u64) {
        for n in 0..count {
            self.objects
                .insert(ObjectId::new(n), Bytes::from_static(b"object"));
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn set_garbage(&self, ids: impl IntoIterator<Item = u64>) {
        *self.garbage.lock() = ids.into_iter().map(ObjectId::new).collect();
    }

    /// Make dehydrate block until `release` is called
    pub fn hold(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(10_000);
    }
}

#[async_trait]
impl ObjectSource for MockObjectStore {
    async fn object_ids(&self) -> EngineResult<BTreeSet<ObjectId>> {
        Ok(self.objects.iter().map(|e| *e.key()).collect())
    }

    async fn dehydrate(&self, ids: &[ObjectId]) -> EngineResult<DehydratedBatch> {
        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        Ok(DehydratedBatch {
            payload: Bytes::from(format!("{} objects", ids.len())),
            string_dictionary: Vec::new(),
            roots: Default::default(),
        })
    }

    async fn apply_sync_batch(&self, batch: &ObjectSyncBatch) -> EngineResult<()> {
        self.applied_sequences.lock().push(batch.sequence.value());
        for id in &batch.object_ids {
            self.objects.insert(*id, Bytes::from_static(b"object"));
        }
        Ok(())
    }

    async fn delete_objects(&self, ids: &BTreeSet<ObjectId>) -> EngineResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        for id in ids {
            self.objects.remove(id);
        }
        Ok(())
    }

    async fn identify_garbage(&self) -> EngineResult<BTreeSet<ObjectId>> {
        Ok(self.garbage.lock().clone())
    }
}

/// In-memory search index store
pub struct MockIndexStore {
    files: Mutex<Vec<(IndexFileRef, Bytes)>>,
    pub applied: Mutex<Vec<(String, String, Bytes)>>,
    gated: AtomicBool,
    gate: Semaphore,
}

impl MockIndexStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn add_file(&self, index_name: &str, file_name: &str, contents: &[u8]) {
        self.files.lock().push((
            IndexFileRef {
                index_name: index_name.to_string(),
                file_name: file_name.to_string(),
                byte_length: contents.len(),
            },
            Bytes::copy_from_slice(contents),
        ));
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }

    /// Make read_file block until `release` is called
    pub fn hold(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(10_000);
    }
}

#[async_trait]
impl IndexSource for MockIndexStore {
    async fn index_files(&self) -> EngineResult<Vec<IndexFileRef>> {
        Ok(self.files.lock().iter().map(|(f, _)| f.clone()).collect())
    }

    async fn read_file(&self, file: &IndexFileRef) -> EngineResult<Bytes> {
        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        let files = self.files.lock();
        let found = files
            .iter()
            .find(|(f, _)| f.index_name == file.index_name && f.file_name == file.file_name)
            .map(|(_, bytes)| bytes.clone());
        Ok(found.unwrap_or_default())
    }

    async fn apply_file(&self, file: &IndexSyncFile) -> EngineResult<()> {
        self.applied.lock().push((
            file.index_name.clone(),
            file.file_name.clone(),
            file.contents.clone(),
        ));
        Ok(())
    }
}

/// In-memory transaction system
pub struct MockTransactionSystem {
    /// Applied transactions with their apply mode and global id
    pub applied: Mutex<Vec<(ServerTransactionId, ApplyMode, GlobalTransactionId)>>,
    /// Sequence ids observed on applied relay batches
    pub applied_sequences: Mutex<Vec<u64>>,
    /// Watermarks passed to trim_below, in call order
    pub trimmed: Mutex<Vec<GlobalTransactionId>>,
    /// Transactions reported fully relayed
    pub relay_completed: Mutex<Vec<ServerTransactionId>>,
    pending: AtomicUsize,
    auto_quiesce: AtomicBool,
    quiesce_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl MockTransactionSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            applied: Mutex::new(Vec::new()),
            applied_sequences: Mutex::new(Vec::new()),
            trimmed: Mutex::new(Vec::new()),
            relay_completed: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            auto_quiesce: AtomicBool::new(true),
            quiesce_callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn set_pending(&self, count: usize) {
        self.pending.store(count, Ordering::SeqCst);
    }

    /// Stop quiesce callbacks from firing until `fire_quiesce`
    pub fn set_manual_quiesce(&self) {
        self.auto_quiesce.store(false, Ordering::SeqCst);
    }

    pub fn fire_quiesce(&self) {
        let callbacks: Vec<_> = self.quiesce_callbacks.lock().drain(..).collect();
        for callback in callbacks {
            callback();
        }
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }

    pub fn relay_completed_count(&self) -> usize {
        self.relay_completed.lock().len()
    }
}

#[async_trait]
impl TransactionSystem for MockTransactionSystem {
    async fn apply_replicated(
        &self,
        batch: &RelayedCommitBatch,
        mode: ApplyMode,
    ) -> EngineResult<Vec<ServerTransactionId>> {
        self.applied_sequences.lock().push(batch.sequence.value());
        let mut applied = Vec::new();
        for (txn, gtid) in &batch.global_ids {
            self.applied.lock().push((txn.clone(), mode, *gtid));
            applied.push(txn.clone());
        }
        Ok(applied)
    }

    fn pending_transaction_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn trim_below(&self, watermark: GlobalTransactionId) -> EngineResult<()> {
        self.trimmed.lock().push(watermark);
        Ok(())
    }

    fn on_quiesce(&self, callback: Box<dyn FnOnce() + Send>) {
        if self.auto_quiesce.load(Ordering::SeqCst) {
            callback();
        } else {
            self.quiesce_callbacks.lock().push(callback);
        }
    }

    fn relay_complete(&self, transactions: &[ServerTransactionId]) {
        self.relay_completed.lock().extend_from_slice(transactions);
    }
}

/// One engine plus its mock collaborators
pub struct TestNode {
    pub node_id: NodeId,
    pub engine: Engine,
    pub objects: Arc<MockObjectStore>,
    pub indexes: Arc<MockIndexStore>,
    pub txns: Arc<MockTransactionSystem>,
}

impl TestNode {
    pub fn mode(&self) -> ServerMode {
        self.engine.current_mode()
    }

    /// A committed batch entering through this node
    pub fn committed_batch(&self, ids: impl IntoIterator<Item = u64>) -> CommittedBatch {
        CommittedBatch {
            source: self.node_id.clone(),
            payload: Bytes::from_static(b"serialized"),
            transactions: ids
                .into_iter()
                .map(|n| ServerTransactionId::new(self.node_id.clone(), n))
                .collect(),
        }
    }
}

/// Test cluster manager
pub struct TestCluster {
    pub group: MemoryGroup,
}

impl TestCluster {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        Self {
            group: MemoryGroup::new(),
        }
    }

    /// Join a node with the given deterministic seed and election weight
    pub async fn add_node(&self, seed: u8, weight: u64) -> TestNode {
        self.add_node_with(seed, weight, |_| {}).await
    }

    /// Join a node, tweaking its configuration first
    pub async fn add_node_with(
        &self,
        seed: u8,
        weight: u64,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> TestNode {
        let mut config = EngineConfig::default();
        config.election.election_timeout = Duration::from_millis(100);
        config.election.enrollment_weight = weight;
        config.sync.inter_batch_delay = Duration::from_millis(1);
        tweak(&mut config);

        let node_id = NodeId::from_seed(seed);
        let transport = Arc::new(self.group.join(node_id.clone()));
        let objects = MockObjectStore::new();
        let indexes = MockIndexStore::new();
        let txns = MockTransactionSystem::new();

        let mut engine = EngineBuilder::new(config)
            .with_transport(transport)
            .with_object_source(objects.clone())
            .with_index_source(indexes.clone())
            .with_transaction_system(txns.clone())
            .with_existing_data(true)
            .build()
            .expect("engine builds");
        engine.start().await.expect("engine starts");

        TestNode {
            node_id,
            engine,
            objects,
            indexes,
            txns,
        }
    }

    /// Join as a raw transport that participates in no protocol
    pub fn join_observer(&self, seed: u8) -> MemoryGroupTransport {
        self.group.join(NodeId::from_seed(seed))
    }
}

/// Poll until `pred` holds, panicking after five seconds
pub async fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if pred() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_mode(node: &TestNode, mode: ServerMode) {
    let what = format!("{} to reach {mode}", node.node_id);
    wait_until(&what, || node.mode() == mode).await;
}

/// Receive and decode the next engine message seen by a raw observer
pub async fn next_message(
    incoming: &mut (impl futures::Stream<Item = strata_transport::GroupEnvelope> + Unpin),
) -> (NodeId, GroupMessage) {
    let envelope = tokio::time::timeout(Duration::from_secs(5), incoming.next())
        .await
        .expect("timed out waiting for a message")
        .expect("transport closed");
    let message = GroupMessage::decode(&envelope.payload).expect("decodable message");
    (envelope.sender, message)
}

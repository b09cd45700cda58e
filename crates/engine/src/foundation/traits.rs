//! External collaborator interfaces
//!
//! The storage engine, search indexes, and the local transaction system
//! are external to this engine; these traits are the narrow surfaces the
//! replication pipelines consume them through.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bytes::Bytes;
use strata_topology::NodeId;

use super::messages::{IndexSyncFile, ObjectSyncBatch, RelayedCommitBatch};
use super::types::{GlobalTransactionId, ObjectId, ServerTransactionId};
use crate::error::EngineResult;

/// One dehydrated batch of managed objects, produced by the object store
///
/// The store must release the source objects before returning, so no state
/// lock is held across the network send.
#[derive(Debug, Clone)]
pub struct DehydratedBatch {
    /// Serialized object data
    pub payload: Bytes,
    /// String dictionary referenced by the payload
    pub string_dictionary: Vec<String>,
    /// Root bindings carried with this batch
    pub roots: BTreeMap<String, ObjectId>,
}

/// Reference to one search-index file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFileRef {
    /// Index the file belongs to
    pub index_name: String,
    /// File name within the index
    pub file_name: String,
    /// File size in bytes
    pub byte_length: usize,
}

/// How a passive applies a relayed batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Ordinary replicated commit on a standby passive
    Replicated,
    /// Applied during initial sync, before the passive holds full state
    ObjectSync,
}

/// A locally committed batch handed to the engine for relay
#[derive(Debug, Clone)]
pub struct CommittedBatch {
    /// Node the batch was committed through
    pub source: NodeId,
    /// Serialized transactions
    pub payload: Bytes,
    /// Identity of every transaction in the batch, in commit order
    pub transactions: Vec<ServerTransactionId>,
}

/// The object graph engine, as seen by the sync and GC pipelines
#[async_trait]
pub trait ObjectSource: Send + Sync + 'static {
    /// Snapshot the ids of all managed objects, taken at sync start
    async fn object_ids(&self) -> EngineResult<BTreeSet<ObjectId>>;

    /// Serialize the given objects for the wire, releasing them back to
    /// the store before returning
    async fn dehydrate(&self, ids: &[ObjectId]) -> EngineResult<DehydratedBatch>;

    /// Apply a received sync batch (passive side)
    async fn apply_sync_batch(&self, batch: &ObjectSyncBatch) -> EngineResult<()>;

    /// Remove exactly the given objects from the local object map
    async fn delete_objects(&self, ids: &BTreeSet<ObjectId>) -> EngineResult<()>;

    /// Compute the garbage set for the current GC cycle (active side,
    /// called only at a transaction quiesce point)
    async fn identify_garbage(&self) -> EngineResult<BTreeSet<ObjectId>>;
}

/// The search index store, as seen by the index sync pipeline
#[async_trait]
pub trait IndexSource: Send + Sync + 'static {
    /// Enumerate index files, taken at sync start
    async fn index_files(&self) -> EngineResult<Vec<IndexFileRef>>;

    /// Read one file's bytes
    async fn read_file(&self, file: &IndexFileRef) -> EngineResult<Bytes>;

    /// Apply a received index file (passive side)
    async fn apply_file(&self, file: &IndexSyncFile) -> EngineResult<()>;
}

/// The local transaction system, as seen by the relay and GC pipelines
#[async_trait]
pub trait TransactionSystem: Send + Sync + 'static {
    /// Apply a relayed batch, returning the ids actually applied (these
    /// are what gets acknowledged back to the active)
    async fn apply_replicated(
        &self,
        batch: &RelayedCommitBatch,
        mode: ApplyMode,
    ) -> EngineResult<Vec<ServerTransactionId>>;

    /// Transactions received but not yet fully processed, read by the ack
    /// throttle
    fn pending_transaction_count(&self) -> usize;

    /// Trim the local transaction log below the watermark
    async fn trim_below(&self, watermark: GlobalTransactionId) -> EngineResult<()>;

    /// Register a one-shot callback that fires once every transaction in
    /// flight at registration time has finished
    fn on_quiesce(&self, callback: Box<dyn FnOnce() + Send>);

    /// Notification that the given transactions are fully relayed: every
    /// currently known replica has acknowledged them (or departed)
    fn relay_complete(&self, transactions: &[ServerTransactionId]);
}

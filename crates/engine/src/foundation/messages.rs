//! Wire message catalog
//!
//! Every message the engine exchanges over the group channel, as one
//! tagged union per protocol under a single top-level [`GroupMessage`].
//! Encoding is CBOR; a payload that fails to decode is treated exactly
//! like an unknown message type: a fatal protocol violation, never
//! something to mask or retry.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strata_topology::NodeId;

use super::cluster_state::ClusterStateDelta;
use super::enrollment::Enrollment;
use super::types::{GlobalTransactionId, ObjectId, SequenceId, ServerMode, ServerTransactionId};
use crate::error::EngineResult;

/// Top-level routing envelope for all engine traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GroupMessage {
    /// Election protocol
    Election(ElectionMessage),
    /// Replicated cluster-state delta
    ClusterState(ClusterStateDelta),
    /// Object graph sync protocol
    ObjectSync(ObjectSyncMessage),
    /// Search index sync protocol
    IndexSync(IndexSyncMessage),
    /// Transaction relay protocol
    Relay(RelayMessage),
    /// Distributed GC protocol
    Gc(GcMessage),
    /// Node eviction notice
    Zap(ZapNotice),
}

impl GroupMessage {
    /// Message kind tag carried in the transport envelope
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Election(_) => "election",
            Self::ClusterState(_) => "cluster_state",
            Self::ObjectSync(_) => "object_sync",
            Self::IndexSync(_) => "index_sync",
            Self::Relay(_) => "relay",
            Self::Gc(_) => "gc",
            Self::Zap(_) => "zap",
        }
    }

    /// Encode for the wire
    pub fn encode(&self) -> EngineResult<Bytes> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Decode from the wire
    pub fn decode(payload: &Bytes) -> EngineResult<Self> {
        Ok(ciborium::from_reader(payload.as_ref())?)
    }
}

/// Election message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionMessageKind {
    /// A candidate opened an election
    StartElection,
    /// A peer's ballot in response to `StartElection`
    ElectionResult,
    /// Agreement with a declared winner
    ResultAgreed,
    /// Disagreement with a declared winner, forcing a re-run
    ResultConflict,
    /// An established active telling a candidate to stand down
    AbortElection,
    /// The winner declaring itself
    ElectionWon,
    /// An established active publishing its state to a joining node
    ElectionWonAlready,
    /// The active promoting a fully synced passive
    MoveToPassiveStandby,
}

/// Election protocol message: a kind plus the sender's credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionMessage {
    /// Message kind
    pub kind: ElectionMessageKind,
    /// The sender's (or winner's) enrollment
    pub enrollment: Enrollment,
}

impl ElectionMessage {
    /// Create an election message
    pub fn new(kind: ElectionMessageKind, enrollment: Enrollment) -> Self {
        Self { kind, enrollment }
    }
}

/// Object graph sync protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ObjectSyncMessage {
    /// Active asks a joining passive whether a full sync may begin
    Begin,
    /// Passive's answer to `Begin`
    BeginResponse {
        /// The responder's current mode
        current_mode: ServerMode,
        /// False once this incarnation has already been synced
        sync_allowed: bool,
    },
    /// One batch of dehydrated objects
    Batch(ObjectSyncBatch),
    /// No objects remain for this destination
    Complete {
        /// Stream sequence id
        sequence: SequenceId,
    },
    /// Destination applied everything up to `Complete`
    CompleteAck {
        /// Sequence id echoed from `Complete`
        sequence: SequenceId,
    },
}

/// One batch of dehydrated managed objects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSyncBatch {
    /// Identifiers of the objects in this batch
    pub object_ids: BTreeSet<ObjectId>,
    /// Number of objects serialized into `payload`
    pub unit_count: usize,
    /// Serialized object data (storage engine encoding; opaque here)
    pub payload: Bytes,
    /// String dictionary referenced by the payload
    pub string_dictionary: Vec<String>,
    /// Root name to object id bindings carried with this batch
    pub roots: BTreeMap<String, ObjectId>,
    /// Stream sequence id
    pub sequence: SequenceId,
}

/// Search index sync protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexSyncMessage {
    /// Opens the index stream, carrying the expected file count
    Start {
        /// Stream sequence id
        sequence: SequenceId,
        /// Number of files that will follow
        file_count: usize,
    },
    /// One index file
    File(IndexSyncFile),
    /// No files remain for this destination
    Complete {
        /// Stream sequence id
        sequence: SequenceId,
    },
    /// Destination applied everything up to `Complete`
    CompleteAck {
        /// Sequence id echoed from `Complete`
        sequence: SequenceId,
    },
}

/// One search-index file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSyncFile {
    /// Index the file belongs to
    pub index_name: String,
    /// File name within the index
    pub file_name: String,
    /// Length of `contents`
    pub byte_length: usize,
    /// Raw file bytes
    pub contents: Bytes,
    /// Stream sequence id
    pub sequence: SequenceId,
}

/// Transaction relay protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayMessage {
    /// A committed batch relayed from the active
    Commit(RelayedCommitBatch),
    /// A passive acknowledging applied transactions
    Ack(TransactionAck),
}

/// A committed, serialized transaction batch relayed active to passive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayedCommitBatch {
    /// Node the batch was committed through
    pub source: NodeId,
    /// Serialized transactions (storage engine encoding; opaque here)
    pub payload: Bytes,
    /// Global order assigned to each transaction in the batch
    pub global_ids: BTreeMap<ServerTransactionId, GlobalTransactionId>,
    /// Stream sequence id
    pub sequence: SequenceId,
    /// Everything below this is durable everywhere and may be trimmed
    pub low_water_mark: GlobalTransactionId,
}

/// Acknowledgement of applied transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionAck {
    /// The acking node
    pub destination: NodeId,
    /// Every transaction the destination just applied
    pub acked: BTreeSet<ServerTransactionId>,
}

/// Distributed GC protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GcMessage {
    /// Status broadcast; carries no deletion authority
    Status(GcStatus),
    /// The deletion set for one GC iteration
    Result(GcResult),
}

/// GC status broadcast kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcStatusKind {
    /// A collection cycle started
    Start,
    /// A collection cycle was cancelled
    Cancel,
}

/// GC status broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcStatus {
    /// Status kind
    pub kind: GcStatusKind,
    /// Cycle description
    pub info: GcInfo,
}

/// Description of a GC cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcInfo {
    /// Monotonically increasing cycle number
    pub iteration: u64,
    /// When the cycle started, milliseconds since the epoch
    pub started_at_epoch_millis: u64,
}

/// The deletion set for one GC iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcResult {
    /// Cycle number the set was computed in
    pub iteration: u64,
    /// Objects every replica must remove
    pub deleted: BTreeSet<ObjectId>,
}

/// Reason a node is being evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZapReason {
    /// An active-to-passive send failed
    CommunicationError,
    /// A passive-to-active send failed
    CommunicationToActiveError,
    /// Two actives discovered each other after a partition
    SplitBrain,
    /// A peer violated the protocol
    ProgramError,
    /// A node tried to rejoin with stale replicated state
    DirtyDatabase,
}

/// Notice that a node has been evicted from the group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZapNotice {
    /// The evicted node
    pub target: NodeId,
    /// Why it was evicted
    pub reason: ZapReason,
    /// Human-readable cause
    pub cause: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_relay_fields() {
        let source = NodeId::from_seed(1);
        let txn = ServerTransactionId::new(source.clone(), 7);
        let msg = GroupMessage::Relay(RelayMessage::Commit(RelayedCommitBatch {
            source,
            payload: Bytes::from_static(b"opaque"),
            global_ids: BTreeMap::from([(txn.clone(), GlobalTransactionId::new(42))]),
            sequence: SequenceId::new(3),
            low_water_mark: GlobalTransactionId::new(40),
        }));

        let decoded = GroupMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            GroupMessage::Relay(RelayMessage::Commit(batch)) => {
                assert_eq!(batch.sequence, SequenceId::new(3));
                assert_eq!(batch.low_water_mark, GlobalTransactionId::new(40));
                assert_eq!(batch.global_ids[&txn], GlobalTransactionId::new(42));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_garbage_payload_is_a_fatal_protocol_error() {
        let err = GroupMessage::decode(&Bytes::from_static(b"\xff\xff\xff")).unwrap_err();
        assert!(err.is_fatal());
    }
}

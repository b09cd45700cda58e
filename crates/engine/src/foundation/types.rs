//! Identifier types and the server role state machine

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_topology::NodeId;

/// Cluster-wide transaction order, assigned exactly once at the active.
///
/// Passives record these but never assign them.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GlobalTransactionId(u64);

impl GlobalTransactionId {
    /// Create from a raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gtid-{}", self.0)
    }
}

/// The identity a transaction is acknowledged by: the committing client's
/// transaction id scoped by the node it entered the cluster through.
/// Distinct from the transaction's [`GlobalTransactionId`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerTransactionId {
    /// Node the transaction was committed through
    pub source: NodeId,
    /// Per-client transaction id
    pub client_txn: u64,
}

impl ServerTransactionId {
    /// Create a new server transaction id
    pub fn new(source: NodeId, client_txn: u64) -> Self {
        Self { source, client_txn }
    }
}

impl fmt::Display for ServerTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}-{}", self.source, self.client_txn)
    }
}

/// Per-destination message sequence number
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceId(u64);

impl SequenceId {
    /// Create from a raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

/// Managed object identifier
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Create from a raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid-{}", self.0)
    }
}

/// Client connection channel identifier
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Create from a raw value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Server role state machine
///
/// `Start → ElectionInProgress → {Active | PassiveUninitialized} →
/// PassiveStandby`, with `Stopped` reachable from anywhere. All
/// transitions go through `Engine`-owned state so the legal-transition
/// checks live in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMode {
    /// Initial state before any election has run
    Start,
    /// An election is running and no winner is known yet
    ElectionInProgress,
    /// The single writable cluster member
    Active,
    /// A passive that has not yet received the active's full state
    PassiveUninitialized,
    /// A passive holding a complete, continuously-updated copy
    PassiveStandby,
    /// Terminal state
    Stopped,
}

impl ServerMode {
    /// Whether this node is the active coordinator
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether this node is a passive of either flavor
    pub fn is_passive(&self) -> bool {
        matches!(self, Self::PassiveUninitialized | Self::PassiveStandby)
    }

    /// Whether an election may be started from this state
    pub fn can_start_election(&self) -> bool {
        matches!(
            self,
            Self::Start | Self::ElectionInProgress | Self::PassiveUninitialized | Self::PassiveStandby
        )
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::ElectionInProgress => write!(f, "ELECTION-IN-PROGRESS"),
            Self::Active => write!(f, "ACTIVE"),
            Self::PassiveUninitialized => write!(f, "PASSIVE-UNINITIALIZED"),
            Self::PassiveStandby => write!(f, "PASSIVE-STANDBY"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

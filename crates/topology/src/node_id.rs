//! Node ID type for the cluster

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a cluster member.
///
/// Used as the map key for all per-node state and as the destination for
/// all group messages. Identifiers are never recycled while the node is a
/// live member. The `Ord` impl is part of the wire contract: election
/// tie-breaking relies on every node ordering `NodeId`s identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new random node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Create a deterministic node ID from a seed (for tests)
    pub fn from_seed(seed: u8) -> Self {
        Self(Uuid::from_bytes([seed; 16]))
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to identify a node in logs
        let hex = self.0.simple().to_string();
        write!(f, "node-{}", &hex[..8])
    }
}

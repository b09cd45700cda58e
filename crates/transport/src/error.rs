//! Error types for group transports

use strata_topology::NodeId;
use thiserror::Error;

/// Errors surfaced by a group transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to deliver a message to a specific member
    #[error("send to {node} failed: {reason}")]
    SendFailed {
        /// Destination that could not be reached
        node: NodeId,
        /// Human-readable cause
        reason: String,
    },

    /// The destination is not a current group member
    #[error("{0} is not a group member")]
    NotAMember(NodeId),

    /// The transport has been shut down
    #[error("transport closed")]
    Closed,

    /// Catch-all for transport-specific failures
    #[error("transport error: {0}")]
    Other(String),
}

//! Group channel abstraction for cluster communication
//!
//! This crate provides the transport-agnostic interface the replication
//! engine runs on. Concrete implementations (in-memory, TCP, ...) live in
//! separate crates.
//!
//! A group transport handles:
//! - Reliable point-to-point delivery to a named member
//! - Best-effort broadcast to the current membership
//! - Join/leave notifications as a membership event stream
//! - Forcible eviction of a member (the enforcement half of zapping)
//!
//! Delivery between any pair of live members is ordered; the engine layers
//! its own per-destination sequence numbers on top to turn any violation of
//! that assumption into a fatal protocol error.

pub mod error;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use strata_topology::NodeId;

pub use error::TransportError as Error;
pub use error::TransportError;

/// A verified message delivered by the group transport
#[derive(Debug, Clone)]
pub struct GroupEnvelope {
    /// The member the message came from
    pub sender: NodeId,
    /// Message kind tag, taken from the sender's envelope
    pub message_type: String,
    /// The message payload
    pub payload: Bytes,
}

/// Membership change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node joined the group
    Joined(NodeId),
    /// A node left the group (departure or eviction)
    Departed(NodeId),
}

/// Transport trait for group communication
///
/// Implementations own connection management and delivery; the engine only
/// ever sees envelopes and membership events.
#[async_trait]
pub trait GroupTransport: Send + Sync + 'static {
    /// The local member's identity
    fn local_node_id(&self) -> &NodeId;

    /// Send a message to a specific group member
    async fn send_to(
        &self,
        recipient: &NodeId,
        payload: Bytes,
        message_type: &str,
    ) -> Result<(), TransportError>;

    /// Broadcast a message to every other current member
    ///
    /// Best effort: members that cannot be reached are skipped. A sender
    /// that needs per-member failure handling uses `send_to`.
    async fn broadcast(&self, payload: Bytes, message_type: &str) -> Result<(), TransportError>;

    /// The other members currently in the group
    fn current_members(&self) -> Vec<NodeId>;

    /// Stream of incoming message envelopes
    fn incoming(&self) -> Pin<Box<dyn Stream<Item = GroupEnvelope> + Send>>;

    /// Stream of membership change events
    fn membership_events(&self) -> Pin<Box<dyn Stream<Item = MembershipEvent> + Send>>;

    /// Forcibly remove a member from the group
    ///
    /// Every remaining member observes a `Departed` event for the target.
    /// Evicting a node that already left is not an error.
    async fn evict(&self, node: &NodeId) -> Result<(), TransportError>;

    /// Shut down the transport, leaving the group
    async fn shutdown(&self) -> Result<(), TransportError>;
}

/// Configuration for transports
#[derive(Debug, Clone)]
pub struct Config {
    /// Message queue size per member
    pub per_member_queue_size: usize,
    /// Membership event queue size
    pub membership_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            per_member_queue_size: 1024,
            membership_queue_size: 64,
        }
    }
}

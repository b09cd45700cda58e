//! In-memory group transport implementation for testing
//!
//! Routes messages between members within the same process, perfect for
//! testing and development scenarios. Members join an explicitly
//! constructed [`MemoryGroup`] rather than a process-global registry, so
//! independent clusters can coexist in one test binary.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use strata_topology::NodeId;
use strata_transport::{Config, GroupEnvelope, GroupTransport, MembershipEvent, TransportError};
use tracing::{debug, info};

/// Per-member delivery queues held by the group router
struct MemberQueues {
    envelope_tx: flume::Sender<GroupEnvelope>,
    membership_tx: flume::Sender<MembershipEvent>,
}

struct GroupInner {
    config: Config,
    members: DashMap<NodeId, MemberQueues>,
    /// (from, to) pairs that fail with a send error, for fault injection
    unreachable: Mutex<HashSet<(NodeId, NodeId)>>,
}

/// An in-process group that members join and leave
///
/// Cloning the handle shares the same group.
#[derive(Clone)]
pub struct MemoryGroup {
    inner: Arc<GroupInner>,
}

impl MemoryGroup {
    /// Create a new empty group with default transport config
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a new empty group
    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                config,
                members: DashMap::new(),
                unreachable: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Join the group as `node_id`, returning the member's transport
    ///
    /// Every existing member observes a `Joined` event.
    pub fn join(&self, node_id: NodeId) -> MemoryGroupTransport {
        let (envelope_tx, envelope_rx) = flume::bounded(self.inner.config.per_member_queue_size);
        let (membership_tx, membership_rx) = flume::bounded(self.inner.config.membership_queue_size);

        self.notify_members(MembershipEvent::Joined(node_id.clone()));

        self.inner.members.insert(
            node_id.clone(),
            MemberQueues {
                envelope_tx,
                membership_tx,
            },
        );

        info!("{} joined memory group", node_id);

        MemoryGroupTransport {
            group: self.inner.clone(),
            node_id,
            envelope_rx,
            membership_rx,
        }
    }

    /// Make sends from `from` to `to` fail (for zap/failure tests)
    pub fn set_unreachable(&self, from: &NodeId, to: &NodeId) {
        self.inner
            .unreachable
            .lock()
            .insert((from.clone(), to.clone()));
    }

    /// Restore delivery from `from` to `to`
    pub fn clear_unreachable(&self, from: &NodeId, to: &NodeId) {
        self.inner
            .unreachable
            .lock()
            .remove(&(from.clone(), to.clone()));
    }

    /// Current group members
    pub fn members(&self) -> Vec<NodeId> {
        self.inner.members.iter().map(|e| e.key().clone()).collect()
    }

    fn notify_members(&self, event: MembershipEvent) {
        for entry in self.inner.members.iter() {
            let _ = entry.value().membership_tx.try_send(event.clone());
        }
    }
}

impl Default for MemoryGroup {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_member(inner: &Arc<GroupInner>, node: &NodeId) -> bool {
    // Dropping the queues disconnects the departed member's streams
    let removed = inner.members.remove(node).is_some();
    if removed {
        for entry in inner.members.iter() {
            let _ = entry
                .value()
                .membership_tx
                .try_send(MembershipEvent::Departed(node.clone()));
        }
    }
    removed
}

/// Memory transport handle for one group member
pub struct MemoryGroupTransport {
    group: Arc<GroupInner>,
    node_id: NodeId,
    envelope_rx: flume::Receiver<GroupEnvelope>,
    membership_rx: flume::Receiver<MembershipEvent>,
}

impl MemoryGroupTransport {
    async fn deliver(
        &self,
        recipient: &NodeId,
        payload: Bytes,
        message_type: &str,
    ) -> Result<(), TransportError> {
        if self
            .group
            .unreachable
            .lock()
            .contains(&(self.node_id.clone(), recipient.clone()))
        {
            return Err(TransportError::SendFailed {
                node: recipient.clone(),
                reason: "simulated network failure".to_string(),
            });
        }

        let envelope_tx = self
            .group
            .members
            .get(recipient)
            .map(|member| member.envelope_tx.clone())
            .ok_or_else(|| TransportError::NotAMember(recipient.clone()))?;

        debug!(
            "memory transport: {} -> {} ({}, {} bytes)",
            self.node_id,
            recipient,
            message_type,
            payload.len()
        );

        // Queue capacity is the backpressure boundary
        envelope_tx
            .send_async(GroupEnvelope {
                sender: self.node_id.clone(),
                message_type: message_type.to_string(),
                payload,
            })
            .await
            .map_err(|_| TransportError::SendFailed {
                node: recipient.clone(),
                reason: "member queue closed".to_string(),
            })
    }
}

#[async_trait]
impl GroupTransport for MemoryGroupTransport {
    fn local_node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn send_to(
        &self,
        recipient: &NodeId,
        payload: Bytes,
        message_type: &str,
    ) -> Result<(), TransportError> {
        self.deliver(recipient, payload, message_type).await
    }

    async fn broadcast(&self, payload: Bytes, message_type: &str) -> Result<(), TransportError> {
        let members = self.current_members();
        for member in members {
            if let Err(e) = self.deliver(&member, payload.clone(), message_type).await {
                debug!("broadcast to {} skipped: {}", member, e);
            }
        }
        Ok(())
    }

    fn current_members(&self) -> Vec<NodeId> {
        self.group
            .members
            .iter()
            .map(|e| e.key().clone())
            .filter(|m| *m != self.node_id)
            .collect()
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = GroupEnvelope> + Send>> {
        Box::pin(self.envelope_rx.clone().into_stream())
    }

    fn membership_events(&self) -> Pin<Box<dyn Stream<Item = MembershipEvent> + Send>> {
        Box::pin(self.membership_rx.clone().into_stream())
    }

    async fn evict(&self, node: &NodeId) -> Result<(), TransportError> {
        if remove_member(&self.group, node) {
            info!("{} evicted {} from memory group", self.node_id, node);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        remove_member(&self.group, &self.node_id);
        Ok(())
    }
}

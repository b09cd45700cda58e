//! Replicated cluster-wide state
//!
//! Process-wide counters (next object id, next global transaction id, next
//! channel id), the cluster identifier, and the set of live client
//! connections. Only the active mutates this state; every mutation is
//! expressed as a [`ClusterStateDelta`] so replicas that apply the same
//! delta sequence converge on identical state.
//!
//! Counters are handed out from reservations: the active extends its
//! reservation in chunks and replicates only the reservation boundary, so
//! a failing-over active can never reuse an identifier the old active may
//! already have handed out.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{ChannelId, GlobalTransactionId, ObjectId};

/// How many ids a single reservation extension covers
const RESERVATION_CHUNK: u64 = 512;

/// A state mutation replicated to every cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStateDelta {
    /// New next-available object id reservation boundary
    ObjectId(u64),
    /// New next-available global transaction id reservation boundary
    GlobalTransactionId(u64),
    /// A client connection was established
    NewConnection(ChannelId),
    /// A client connection went away
    ConnectionDestroyed(ChannelId),
    /// Full state, sent to a joining passive
    CompleteState {
        /// Cluster identifier
        cluster_id: Uuid,
        /// Object id reservation boundary
        next_object_id: u64,
        /// Global transaction id reservation boundary
        next_global_transaction_id: u64,
        /// Channel id reservation boundary
        next_channel_id: u64,
        /// Live client connections
        connections: BTreeSet<ChannelId>,
    },
}

/// A counter handed out from replicated reservations
#[derive(Debug, Default)]
struct ReservedCounter {
    /// Next value to hand out locally
    next: AtomicU64,
    /// End of the replicated reservation
    limit: AtomicU64,
}

impl ReservedCounter {
    /// Hand out one value, returning the new reservation boundary when the
    /// reservation had to be extended
    fn allocate(&self) -> (u64, Option<u64>) {
        let value = self.next.fetch_add(1, Ordering::SeqCst);
        if value >= self.limit.load(Ordering::SeqCst) {
            let new_limit = value + RESERVATION_CHUNK;
            self.limit.store(new_limit, Ordering::SeqCst);
            (value, Some(new_limit))
        } else {
            (value, None)
        }
    }

    /// Adopt a replicated reservation boundary
    fn adopt(&self, boundary: u64) {
        self.next.store(boundary, Ordering::SeqCst);
        self.limit.store(boundary, Ordering::SeqCst);
    }

    fn boundary(&self) -> u64 {
        self.limit.load(Ordering::SeqCst)
    }
}

/// Replicated cluster state
#[derive(Debug)]
pub struct ClusterState {
    cluster_id: Mutex<Uuid>,
    object_ids: ReservedCounter,
    global_txn_ids: ReservedCounter,
    channel_ids: ReservedCounter,
    connections: Mutex<BTreeSet<ChannelId>>,
}

impl ClusterState {
    /// Create cluster state with the given cluster identifier
    pub fn new(cluster_id: Uuid) -> Self {
        Self {
            cluster_id: Mutex::new(cluster_id),
            object_ids: ReservedCounter::default(),
            global_txn_ids: ReservedCounter::default(),
            channel_ids: ReservedCounter::default(),
            connections: Mutex::new(BTreeSet::new()),
        }
    }

    /// The cluster identifier
    pub fn cluster_id(&self) -> Uuid {
        *self.cluster_id.lock()
    }

    /// Allocate an object id (active only)
    pub fn allocate_object_id(&self) -> (ObjectId, Option<ClusterStateDelta>) {
        let (value, extended) = self.object_ids.allocate();
        (ObjectId::new(value), extended.map(ClusterStateDelta::ObjectId))
    }

    /// Allocate a global transaction id (active only)
    pub fn allocate_global_transaction_id(
        &self,
    ) -> (GlobalTransactionId, Option<ClusterStateDelta>) {
        let (value, extended) = self.global_txn_ids.allocate();
        (
            GlobalTransactionId::new(value),
            extended.map(ClusterStateDelta::GlobalTransactionId),
        )
    }

    /// Record a new client connection (active only)
    pub fn connection_established(&self) -> (ChannelId, ClusterStateDelta) {
        let (value, _) = self.channel_ids.allocate();
        let channel = ChannelId::new(value);
        self.connections.lock().insert(channel);
        (channel, ClusterStateDelta::NewConnection(channel))
    }

    /// Record a destroyed client connection (active only)
    pub fn connection_destroyed(&self, channel: ChannelId) -> ClusterStateDelta {
        self.connections.lock().remove(&channel);
        ClusterStateDelta::ConnectionDestroyed(channel)
    }

    /// Live client connections
    pub fn connections(&self) -> BTreeSet<ChannelId> {
        self.connections.lock().clone()
    }

    /// Full-state delta for a joining passive
    pub fn snapshot(&self) -> ClusterStateDelta {
        ClusterStateDelta::CompleteState {
            cluster_id: self.cluster_id(),
            next_object_id: self.object_ids.boundary(),
            next_global_transaction_id: self.global_txn_ids.boundary(),
            next_channel_id: self.channel_ids.boundary(),
            connections: self.connections(),
        }
    }

    /// Apply a replicated delta (passive side)
    pub fn apply(&self, delta: ClusterStateDelta) {
        match delta {
            ClusterStateDelta::ObjectId(boundary) => self.object_ids.adopt(boundary),
            ClusterStateDelta::GlobalTransactionId(boundary) => self.global_txn_ids.adopt(boundary),
            ClusterStateDelta::NewConnection(channel) => {
                self.connections.lock().insert(channel);
            }
            ClusterStateDelta::ConnectionDestroyed(channel) => {
                self.connections.lock().remove(&channel);
            }
            ClusterStateDelta::CompleteState {
                cluster_id,
                next_object_id,
                next_global_transaction_id,
                next_channel_id,
                connections,
            } => {
                *self.cluster_id.lock() = cluster_id;
                self.object_ids.adopt(next_object_id);
                self.global_txn_ids.adopt(next_global_transaction_id);
                self.channel_ids.adopt(next_channel_id);
                *self.connections.lock() = connections;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_extends_in_chunks() {
        let state = ClusterState::new(Uuid::nil());
        let (first, delta) = state.allocate_object_id();
        assert_eq!(first, ObjectId::new(0));
        assert_eq!(delta, Some(ClusterStateDelta::ObjectId(RESERVATION_CHUNK)));

        // Until the reservation is exhausted, no further deltas are needed
        for n in 1..RESERVATION_CHUNK {
            let (id, delta) = state.allocate_object_id();
            assert_eq!(id, ObjectId::new(n));
            assert!(delta.is_none());
        }

        let (id, delta) = state.allocate_object_id();
        assert_eq!(id, ObjectId::new(RESERVATION_CHUNK));
        assert_eq!(
            delta,
            Some(ClusterStateDelta::ObjectId(RESERVATION_CHUNK * 2))
        );
    }

    #[test]
    fn test_replicas_converge_on_the_same_delta_sequence() {
        let active = ClusterState::new(Uuid::new_v4());
        let passive = ClusterState::new(Uuid::nil());
        passive.apply(active.snapshot());

        let mut deltas = Vec::new();
        for _ in 0..3 {
            let (_, delta) = active.allocate_global_transaction_id();
            deltas.extend(delta);
        }
        let (channel, delta) = active.connection_established();
        deltas.push(delta);
        deltas.push(active.connection_destroyed(channel));

        for delta in deltas {
            passive.apply(delta);
        }

        assert_eq!(active.snapshot(), passive.snapshot());
    }

    #[test]
    fn test_failover_never_reuses_handed_out_ids() {
        let active = ClusterState::new(Uuid::new_v4());
        let passive = ClusterState::new(Uuid::nil());
        passive.apply(active.snapshot());

        let (last, delta) = active.allocate_global_transaction_id();
        passive.apply(delta.unwrap());

        // The passive takes over: its first allocation must be beyond
        // anything the old active may have handed out
        let (next, _) = passive.allocate_global_transaction_id();
        assert!(next.value() > last.value());
    }
}

//! Global transaction order and the low-water-mark
//!
//! The active assigns each relayed transaction its global id (drawn from
//! the replicated cluster-state reservation) and tracks which ids are
//! still outstanding, meaning not yet acknowledged by every destination. The
//! pending-ack ledger decides when a transaction completes; this tracker
//! only maps completions to global ids. The low-water-mark is the smallest
//! outstanding global id, or the next assignable id when nothing is
//! outstanding; it never decreases.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::foundation::cluster_state::{ClusterState, ClusterStateDelta};
use crate::foundation::types::{GlobalTransactionId, ServerTransactionId};

#[derive(Default)]
struct TrackerInner {
    /// Global ids not yet acknowledged everywhere
    outstanding: BTreeSet<GlobalTransactionId>,
    /// Global id assigned to each still-outstanding transaction
    assigned: HashMap<ServerTransactionId, GlobalTransactionId>,
    /// One past the highest global id handed out
    next_unassigned: u64,
}

/// Assigns global transaction ids and maintains the low-water-mark
pub struct GlobalTransactionTracker {
    cluster_state: Arc<ClusterState>,
    inner: Mutex<TrackerInner>,
    low_water_mark: AtomicU64,
}

impl GlobalTransactionTracker {
    /// Create a tracker drawing ids from the replicated cluster state
    pub fn new(cluster_state: Arc<ClusterState>) -> Self {
        Self {
            cluster_state,
            inner: Mutex::new(TrackerInner::default()),
            low_water_mark: AtomicU64::new(0),
        }
    }

    /// Assign global ids to a committed batch headed for `destinations`
    /// destinations, returning the id mapping plus any cluster-state
    /// reservation deltas that must be broadcast
    pub fn assign(
        &self,
        transactions: &[ServerTransactionId],
        destinations: usize,
    ) -> (
        BTreeMap<ServerTransactionId, GlobalTransactionId>,
        Vec<ClusterStateDelta>,
    ) {
        let mut inner = self.inner.lock();
        let mut mapping = BTreeMap::new();
        let mut deltas = Vec::new();
        for txn in transactions {
            let (gtid, delta) = self.cluster_state.allocate_global_transaction_id();
            deltas.extend(delta);
            inner.next_unassigned = gtid.value() + 1;
            mapping.insert(txn.clone(), gtid);
            if destinations > 0 {
                inner.outstanding.insert(gtid);
                inner.assigned.insert(txn.clone(), gtid);
            }
        }
        self.advance_low_water_mark(&mut inner);
        (mapping, deltas)
    }

    /// Record that `transactions` are now acknowledged by every
    /// destination (or that their last waiter departed)
    pub fn complete(&self, transactions: &[ServerTransactionId]) {
        let mut inner = self.inner.lock();
        for txn in transactions {
            if let Some(gtid) = inner.assigned.remove(txn) {
                inner.outstanding.remove(&gtid);
            }
        }
        self.advance_low_water_mark(&mut inner);
    }

    /// The current low-water-mark
    pub fn low_water_mark(&self) -> GlobalTransactionId {
        GlobalTransactionId::new(self.low_water_mark.load(Ordering::SeqCst))
    }

    fn advance_low_water_mark(&self, inner: &mut TrackerInner) {
        let candidate = inner
            .outstanding
            .first()
            .map(|gtid| gtid.value())
            .unwrap_or(inner.next_unassigned);
        // Completions only ever move the smallest outstanding id forward;
        // the max guards the invariant regardless
        self.low_water_mark.fetch_max(candidate, Ordering::SeqCst);
    }
}

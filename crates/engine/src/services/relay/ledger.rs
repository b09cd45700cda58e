//! Pending acknowledgement bookkeeping
//!
//! One entry per (transaction, destination), added when a relay batch is
//! sent to the destination and removed exactly once, by the destination's
//! ack, or all at once when the destination leaves membership. A coarse
//! single lock guards the whole ledger; this is bookkeeping, not the data
//! plane.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use strata_topology::NodeId;
use tracing::debug;

use crate::foundation::types::ServerTransactionId;

#[derive(Default)]
struct LedgerInner {
    /// Destination-major view, for departure reconciliation
    by_destination: HashMap<NodeId, HashSet<ServerTransactionId>>,
    /// Outstanding destination count per transaction
    outstanding: HashMap<ServerTransactionId, usize>,
}

/// The pending-ack ledger
#[derive(Default)]
pub struct PendingAckLedger {
    inner: Mutex<LedgerInner>,
}

impl PendingAckLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `transactions` were sent to `destination`
    pub fn record(&self, destination: &NodeId, transactions: &[ServerTransactionId]) {
        let mut inner = self.inner.lock();
        let entries = inner.by_destination.entry(destination.clone()).or_default();
        let mut fresh = Vec::new();
        for txn in transactions {
            if entries.insert(txn.clone()) {
                fresh.push(txn.clone());
            }
        }
        for txn in fresh {
            *inner.outstanding.entry(txn).or_insert(0) += 1;
        }
    }

    /// Process an ack from `destination`, returning the transactions whose
    /// entries reached zero across all destinations
    pub fn ack<'a>(
        &self,
        destination: &NodeId,
        transactions: impl IntoIterator<Item = &'a ServerTransactionId>,
    ) -> Vec<ServerTransactionId> {
        let mut inner = self.inner.lock();
        let mut completed = Vec::new();
        for txn in transactions {
            let removed = inner
                .by_destination
                .get_mut(destination)
                .is_some_and(|entries| entries.remove(txn));
            if !removed {
                // Can happen when the destination was already reconciled
                // out by a departure racing its final ack
                debug!("ack from {destination} for unrecorded {txn}");
                continue;
            }
            if let Some(count) = inner.outstanding.get_mut(txn) {
                *count -= 1;
                if *count == 0 {
                    inner.outstanding.remove(txn);
                    completed.push(txn.clone());
                }
            }
        }
        completed
    }

    /// Resolve every entry for a departed or unreachable destination,
    /// returning the transactions that thereby completed
    pub fn resolve_destination(&self, destination: &NodeId) -> Vec<ServerTransactionId> {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.by_destination.remove(destination) else {
            return Vec::new();
        };
        let mut completed = Vec::new();
        for txn in entries {
            if let Some(count) = inner.outstanding.get_mut(&txn) {
                *count -= 1;
                if *count == 0 {
                    inner.outstanding.remove(&txn);
                    completed.push(txn);
                }
            }
        }
        completed
    }

    /// Outstanding destination count for one transaction
    pub fn pending_for(&self, txn: &ServerTransactionId) -> usize {
        self.inner.lock().outstanding.get(txn).copied().unwrap_or(0)
    }

    /// Total transactions with at least one outstanding destination
    pub fn pending_count(&self) -> usize {
        self.inner.lock().outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(n: u64) -> ServerTransactionId {
        ServerTransactionId::new(NodeId::from_seed(9), n)
    }

    #[test]
    fn test_entry_exists_from_send_until_ack() {
        let ledger = PendingAckLedger::new();
        let dest = NodeId::from_seed(1);
        ledger.record(&dest, &[txn(1), txn(2)]);
        assert_eq!(ledger.pending_for(&txn(1)), 1);

        let completed = ledger.ack(&dest, [&txn(1)]);
        assert_eq!(completed, vec![txn(1)]);
        assert_eq!(ledger.pending_for(&txn(1)), 0);
        assert_eq!(ledger.pending_count(), 1);
    }

    #[test]
    fn test_completion_requires_all_destinations() {
        let ledger = PendingAckLedger::new();
        let a = NodeId::from_seed(1);
        let b = NodeId::from_seed(2);
        ledger.record(&a, &[txn(1)]);
        ledger.record(&b, &[txn(1)]);

        assert!(ledger.ack(&a, [&txn(1)]).is_empty());
        assert_eq!(ledger.ack(&b, [&txn(1)]), vec![txn(1)]);
    }

    #[test]
    fn test_entries_are_removed_exactly_once() {
        let ledger = PendingAckLedger::new();
        let dest = NodeId::from_seed(1);
        ledger.record(&dest, &[txn(1)]);

        assert_eq!(ledger.ack(&dest, [&txn(1)]).len(), 1);
        // A duplicate ack finds nothing to remove
        assert!(ledger.ack(&dest, [&txn(1)]).is_empty());
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn test_departure_resolves_all_entries_for_the_node() {
        let ledger = PendingAckLedger::new();
        let a = NodeId::from_seed(1);
        let b = NodeId::from_seed(2);
        ledger.record(&a, &[txn(1), txn(2)]);
        ledger.record(&b, &[txn(2)]);

        let mut completed = ledger.resolve_destination(&a);
        completed.sort();
        // txn 1 was only waiting on a; txn 2 still waits on b
        assert_eq!(completed, vec![txn(1)]);
        assert_eq!(ledger.pending_for(&txn(2)), 1);
        assert!(ledger.resolve_destination(&a).is_empty());
    }
}

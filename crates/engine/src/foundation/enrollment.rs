//! Election credentials

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use strata_topology::NodeId;

/// A candidate's election credential.
///
/// The total order over enrollments is the election tie-break rule and
/// must be identical on every observer:
///
/// 1. a candidate that already holds data (`is_new == false`) beats a
///    fresh candidate, so an empty newcomer can never out-rank a node
///    carrying replicated state;
/// 2. higher weight wins;
/// 3. equal weights fall back to `NodeId` lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// The candidate
    pub node_id: NodeId,
    /// Whether the candidate joined without any replicated data
    pub is_new: bool,
    /// Comparable election weight
    pub weight: u64,
}

impl Enrollment {
    /// Create an enrollment for a candidate
    pub fn new(node_id: NodeId, is_new: bool, weight: u64) -> Self {
        Self {
            node_id,
            is_new,
            weight,
        }
    }

    /// Whether this enrollment beats `other` under the total order
    pub fn wins_over(&self, other: &Enrollment) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

impl Ord for Enrollment {
    fn cmp(&self, other: &Self) -> Ordering {
        // !is_new ranks above is_new
        (!self.is_new)
            .cmp(&!other.is_new)
            .then(self.weight.cmp(&other.weight))
            .then(self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Enrollment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Enrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Enrollment[{}, weight={}{}]",
            self.node_id,
            self.weight,
            if self.is_new { ", new" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_weight_wins() {
        let low = Enrollment::new(NodeId::from_seed(1), false, 10);
        let high = Enrollment::new(NodeId::from_seed(2), false, 20);
        assert!(high.wins_over(&low));
        assert!(!low.wins_over(&high));
    }

    #[test]
    fn test_existing_data_beats_fresh_candidate() {
        let fresh = Enrollment::new(NodeId::from_seed(1), true, 100);
        let enrolled = Enrollment::new(NodeId::from_seed(2), false, 1);
        assert!(enrolled.wins_over(&fresh));
    }

    #[test]
    fn test_equal_weights_fall_back_to_node_id() {
        let a = Enrollment::new(NodeId::from_seed(1), false, 10);
        let b = Enrollment::new(NodeId::from_seed(2), false, 10);
        assert!(b.wins_over(&a));
        assert!(!a.wins_over(&b));
    }

    #[test]
    fn test_order_is_deterministic_across_observers() {
        let mut one = vec![
            Enrollment::new(NodeId::from_seed(3), false, 5),
            Enrollment::new(NodeId::from_seed(1), true, 50),
            Enrollment::new(NodeId::from_seed(2), false, 5),
        ];
        let mut two = one.clone();
        two.reverse();
        one.sort();
        two.sort();
        assert_eq!(one, two);
        assert_eq!(one.last().unwrap().node_id, NodeId::from_seed(3));
    }
}

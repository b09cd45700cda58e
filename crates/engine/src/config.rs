//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Election configuration
    pub election: ElectionConfig,

    /// State sync configuration
    pub sync: SyncConfig,

    /// Transaction relay configuration
    pub relay: RelayConfig,

    /// Capacity of each pipeline stage queue
    pub stage_queue_capacity: usize,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// How long ballots are collected before a winner is picked. Also the
    /// window a losing candidate waits for the winner to declare itself
    /// before re-running.
    pub election_timeout: Duration,

    /// Weight this node enrolls with. Comparison is weight first, then
    /// node id, so distinct weights make election outcomes fully
    /// predictable.
    pub enrollment_weight: u64,
}

/// State sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum objects requested from the object source per batch
    pub batch_size: usize,

    /// Delay between outbound sync batches, protecting a recovering
    /// passive from saturation
    pub inter_batch_delay: Duration,
}

/// Transaction relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Whether a passive throttles its acks when overloaded
    pub throttle_enabled: bool,

    /// Pending-transaction count at which ack throttling begins
    pub throttle_threshold: usize,

    /// Base sleep for the graded throttle region; actual sleep is
    /// factor * max_sleep, polled every second
    pub throttle_max_sleep: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            election: ElectionConfig::default(),
            sync: SyncConfig::default(),
            relay: RelayConfig::default(),
            stage_queue_capacity: 1024,
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_secs(5),
            enrollment_weight: 0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            inter_batch_delay: Duration::from_millis(50),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            throttle_enabled: true,
            throttle_threshold: 1000,
            throttle_max_sleep: Duration::from_secs(5),
        }
    }
}

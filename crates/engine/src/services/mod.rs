//! Engine services

pub mod election;
pub mod gc;
pub mod relay;
pub mod sync;

use strata_topology::NodeId;

use crate::foundation::types::ServerMode;

/// Cross-service notifications, consumed by the engine's event loop.
///
/// Services never call each other directly; whatever one service needs
/// another to do flows through here as an event.
#[derive(Debug, Clone)]
pub(crate) enum EngineEvent {
    /// The local role changed
    ModeChanged {
        /// Previous mode
        old: ServerMode,
        /// New mode
        new: ServerMode,
    },
    /// A peer accepted this node as its active and needs a full sync
    PassiveJoined(NodeId),
    /// A destination's sync was abandoned before completing
    SyncAbandoned(NodeId),
    /// Both sync pipelines completed and were acknowledged
    NodeSyncComplete(NodeId),
    /// A GC cycle finished; these destinations had their sync deferred
    GcCycleCompleted {
        /// Destinations waiting on the cycle
        deferred: Vec<NodeId>,
    },
}

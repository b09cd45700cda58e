//! Per-destination sync cursors
//!
//! A sync context is the cursor over not-yet-sent units for one
//! destination. It is created when the destination allows a sync, mutated
//! as batches are produced, and discarded when the destination completes
//! or leaves membership. A destination that disconnects mid-sync gets a
//! fresh context (and a fresh full sync) if it ever returns.

use std::collections::VecDeque;

use crate::foundation::traits::IndexFileRef;
use crate::foundation::types::ObjectId;

/// Cursor over not-yet-sent managed objects
#[derive(Debug, Default)]
pub(crate) struct ObjectCursor {
    pub remaining: VecDeque<ObjectId>,
    pub total: usize,
}

/// Cursor over not-yet-sent index files
#[derive(Debug, Default)]
pub(crate) struct IndexCursor {
    pub remaining: VecDeque<IndexFileRef>,
    pub total: usize,
    pub started: bool,
}

/// All sync state for one destination
#[derive(Debug, Default)]
pub(crate) struct NodeSyncState {
    /// Whether the destination has answered the begin handshake
    pub begun: bool,
    pub object: ObjectCursor,
    pub index: IndexCursor,
    pub object_complete: bool,
    pub index_complete: bool,
}

impl NodeSyncState {
    /// Standby-readiness is the conjunction of both pipelines; partial
    /// sync must never count
    pub fn is_complete(&self) -> bool {
        self.object_complete && self.index_complete
    }
}

//! Distributed GC coordinator
//!
//! A cycle never stops the world: the coordinator registers a one-shot
//! quiesce callback with the transaction system and only computes the
//! garbage set once every transaction that was in flight at registration
//! has finished. The result is broadcast as `DGC_RESULT(iteration, set)`
//! and applied idempotently everywhere: an iteration at or below the last
//! applied one is a logged no-op, never an error. Start/cancel broadcasts
//! carry no deletion authority.
//!
//! Collection is mutually exclusive with passive sync: while any
//! destination is syncing, cycles are refused, and a sync request that
//! arrives mid-cycle is deferred until the cycle completes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use strata_topology::NodeId;
use strata_transport::GroupTransport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::foundation::messages::{GcInfo, GcMessage, GcResult, GcStatus, GcStatusKind, GroupMessage};
use crate::foundation::traits::{ObjectSource, TransactionSystem};
use crate::foundation::types::ServerMode;
use crate::services::EngineEvent;

struct GcState {
    /// Iteration of the running cycle, if any
    cycle: Option<u64>,
    /// Next iteration to hand out
    next_iteration: u64,
    /// Highest iteration whose result was applied locally
    last_applied: u64,
    /// Destinations currently being synced (collection disabled)
    syncing: HashSet<NodeId>,
    /// Destinations whose sync is deferred until the cycle ends
    deferred: Vec<NodeId>,
}

enum GcWork {
    Quiesced { iteration: u64 },
}

/// The distributed GC coordinator
pub struct GcCoordinator {
    transport: Arc<dyn GroupTransport>,
    object_source: Arc<dyn ObjectSource>,
    txn_system: Arc<dyn TransactionSystem>,
    mode: watch::Receiver<ServerMode>,
    state: Mutex<GcState>,
    events: flume::Sender<EngineEvent>,
    work_tx: flume::Sender<GcWork>,
    work_rx: flume::Receiver<GcWork>,
}

impl GcCoordinator {
    /// Create the coordinator
    pub fn new(
        queue_capacity: usize,
        transport: Arc<dyn GroupTransport>,
        object_source: Arc<dyn ObjectSource>,
        txn_system: Arc<dyn TransactionSystem>,
        mode: watch::Receiver<ServerMode>,
        events: flume::Sender<EngineEvent>,
    ) -> Self {
        let (work_tx, work_rx) = flume::bounded(queue_capacity);
        Self {
            transport,
            object_source,
            txn_system,
            mode,
            state: Mutex::new(GcState {
                cycle: None,
                next_iteration: 1,
                last_applied: 0,
                syncing: HashSet::new(),
                deferred: Vec::new(),
            }),
            events,
            work_tx,
            work_rx,
        }
    }

    /// Spawn the collection worker
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Ok(work) = coordinator.work_rx.recv_async().await {
                match work {
                    GcWork::Quiesced { iteration } => {
                        coordinator.run_collection(iteration).await;
                    }
                }
            }
        })
    }

    /// Start a collection cycle (active only)
    ///
    /// Returns false when a cycle is already running, a sync holds
    /// collection disabled, or this node is not the active.
    pub async fn start_cycle(self: &Arc<Self>) -> EngineResult<bool> {
        if !self.mode.borrow().is_active() {
            debug!("not active, refusing to start a GC cycle");
            return Ok(false);
        }
        let iteration = {
            let mut state = self.state.lock();
            if state.cycle.is_some() {
                debug!("GC cycle already running");
                return Ok(false);
            }
            if !state.syncing.is_empty() {
                info!(
                    "GC disabled while {} passives sync",
                    state.syncing.len()
                );
                return Ok(false);
            }
            let iteration = state.next_iteration;
            state.next_iteration += 1;
            state.cycle = Some(iteration);
            iteration
        };

        info!("starting GC cycle {iteration}");
        self.broadcast_status(GcStatusKind::Start, iteration).await;

        // The deletion set is only consistent at the quiesce point
        let work_tx = self.work_tx.clone();
        self.txn_system.on_quiesce(Box::new(move || {
            let _ = work_tx.send(GcWork::Quiesced { iteration });
        }));
        Ok(true)
    }

    /// Cancel the running cycle, if any
    pub async fn cancel_cycle(self: &Arc<Self>) {
        let iteration = {
            let mut state = self.state.lock();
            state.cycle.take()
        };
        if let Some(iteration) = iteration {
            info!("cancelling GC cycle {iteration}");
            self.broadcast_status(GcStatusKind::Cancel, iteration).await;
        }
    }

    /// A destination wants a sync; collection must be off first
    ///
    /// Returns true when the sync may begin immediately, false when it is
    /// deferred until the running cycle completes.
    pub fn request_disable_for_sync(&self, node: &NodeId) -> bool {
        let mut state = self.state.lock();
        state.syncing.insert(node.clone());
        if state.cycle.is_some() {
            info!("GC cycle running, deferring sync for {node}");
            state.deferred.push(node.clone());
            false
        } else {
            debug!("GC disabled for sync of {node}");
            true
        }
    }

    /// A destination's sync finished or was abandoned
    pub fn sync_finished(&self, node: &NodeId) {
        let mut state = self.state.lock();
        state.deferred.retain(|n| n != node);
        if state.syncing.remove(node) && state.syncing.is_empty() {
            info!("all passives synced, GC re-enabled");
        }
    }

    /// Handle an inbound GC protocol message
    pub async fn handle_message(&self, from: &NodeId, message: GcMessage) -> EngineResult<()> {
        match message {
            GcMessage::Status(status) => {
                info!(
                    "GC {:?} (iteration {}) announced by {from}",
                    status.kind, status.info.iteration
                );
                Ok(())
            }
            GcMessage::Result(result) => self.apply_result(from, result).await,
        }
    }

    /// Apply a disseminated deletion set, keyed by iteration
    async fn apply_result(&self, from: &NodeId, result: GcResult) -> EngineResult<()> {
        if self.mode.borrow().is_active() {
            warn!(
                "ignoring GC result from {from} while active (iteration {})",
                result.iteration
            );
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            if result.iteration <= state.last_applied {
                debug!(
                    "GC result iteration {} already applied (at {}), no-op",
                    result.iteration, state.last_applied
                );
                return Ok(());
            }
            state.last_applied = result.iteration;
        }
        info!(
            "applying GC result iteration {}: deleting {} objects",
            result.iteration,
            result.deleted.len()
        );
        self.object_source.delete_objects(&result.deleted).await
    }

    /// Compute and disseminate the deletion set at the quiesce point
    async fn run_collection(self: &Arc<Self>, iteration: u64) {
        let still_running = self.state.lock().cycle == Some(iteration);
        if !still_running {
            debug!("GC cycle {iteration} was cancelled before quiesce");
            return;
        }

        let deleted = match self.object_source.identify_garbage().await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("garbage identification failed, cancelling cycle {iteration}: {e}");
                self.cancel_cycle().await;
                return;
            }
        };

        info!(
            "GC cycle {iteration} identified {} garbage objects",
            deleted.len()
        );
        if !deleted.is_empty() {
            let result = GcResult {
                iteration,
                deleted: deleted.clone(),
            };
            let message = GroupMessage::Gc(GcMessage::Result(result));
            match message.encode() {
                Ok(payload) => {
                    if let Err(e) = self.transport.broadcast(payload, message.kind()).await {
                        warn!("GC result broadcast failed: {e}");
                    }
                }
                Err(e) => warn!("failed to encode GC result: {e}"),
            }
            if let Err(e) = self.object_source.delete_objects(&deleted).await {
                warn!("local garbage deletion failed: {e}");
            }
        }

        let deferred = {
            let mut state = self.state.lock();
            state.cycle = None;
            state.last_applied = state.last_applied.max(iteration);
            std::mem::take(&mut state.deferred)
        };
        let _ = self.events.send(EngineEvent::GcCycleCompleted { deferred });
    }

    async fn broadcast_status(&self, kind: GcStatusKind, iteration: u64) {
        let info = GcInfo {
            iteration,
            started_at_epoch_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };
        let message = GroupMessage::Gc(GcMessage::Status(GcStatus { kind, info }));
        match message.encode() {
            Ok(payload) => {
                if let Err(e) = self.transport.broadcast(payload, message.kind()).await {
                    warn!("GC status broadcast failed: {e}");
                }
            }
            Err(e) => warn!("failed to encode GC status: {e}"),
        }
    }
}

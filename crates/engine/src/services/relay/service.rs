//! Transaction relay and acknowledgement pipeline
//!
//! Active side: every committed batch fans out to all known passives with
//! ledger entries recorded per destination, a destination sequence id, and
//! the current low-water-mark attached. A failed send resolves that
//! destination's ledger entries immediately and zaps it, so nothing ever
//! waits on an unreachable peer.
//!
//! Passive side: batches are sequence-checked, applied, the local log is
//! trimmed to the enclosed watermark, and an ack naming every applied
//! transaction is sent back, through the ack throttle when the passive is
//! falling behind.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_topology::NodeId;
use strata_transport::GroupTransport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ledger::PendingAckLedger;
use super::throttle::AckThrottle;
use super::tracker::GlobalTransactionTracker;
use crate::config::RelayConfig;
use crate::error::{EngineResult, Error};
use crate::foundation::messages::{
    GroupMessage, RelayMessage, RelayedCommitBatch, TransactionAck, ZapReason,
};
use crate::foundation::sequence::{SequenceChecker, SequencedSender};
use crate::foundation::traits::{ApplyMode, CommittedBatch, TransactionSystem};
use crate::foundation::types::ServerMode;
use crate::foundation::zap::Zapper;

/// The relay service
pub struct RelayService {
    transport: Arc<dyn GroupTransport>,
    zapper: Zapper,
    txn_system: Arc<dyn TransactionSystem>,
    /// Sequence space shared with the object sync pipeline
    data_sender: Arc<SequencedSender>,
    /// Inbound check for the active's data stream, shared with object sync
    data_order: Arc<SequenceChecker>,
    ledger: Arc<PendingAckLedger>,
    tracker: Arc<GlobalTransactionTracker>,
    throttle: AckThrottle,
    mode: watch::Receiver<ServerMode>,
    destinations: Mutex<BTreeSet<NodeId>>,
    commit_tx: flume::Sender<CommittedBatch>,
    commit_rx: flume::Receiver<CommittedBatch>,
}

impl RelayService {
    /// Create the relay service
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &RelayConfig,
        queue_capacity: usize,
        transport: Arc<dyn GroupTransport>,
        zapper: Zapper,
        txn_system: Arc<dyn TransactionSystem>,
        data_sender: Arc<SequencedSender>,
        data_order: Arc<SequenceChecker>,
        tracker: Arc<GlobalTransactionTracker>,
        mode: watch::Receiver<ServerMode>,
    ) -> Self {
        let (commit_tx, commit_rx) = flume::bounded(queue_capacity);
        Self {
            transport,
            zapper,
            txn_system,
            data_sender,
            data_order,
            ledger: Arc::new(PendingAckLedger::new()),
            tracker,
            throttle: AckThrottle::new(config),
            mode,
            destinations: Mutex::new(BTreeSet::new()),
            commit_tx,
            commit_rx,
        }
    }

    /// Spawn the relay stage worker
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Ok(batch) = service.commit_rx.recv_async().await {
                service.relay_batch(batch).await;
            }
        })
    }

    /// Hand a locally committed batch to the relay stage
    pub async fn submit(&self, batch: CommittedBatch) -> EngineResult<()> {
        self.commit_tx
            .send_async(batch)
            .await
            .map_err(|_| Error::invalid_state("relay stage is not running"))
    }

    /// Start relaying to a destination
    pub fn add_destination(&self, node: &NodeId) {
        if self.destinations.lock().insert(node.clone()) {
            info!("relaying transactions to {node}");
        }
    }

    /// Transactions with at least one outstanding ack
    pub fn pending_acks(&self) -> usize {
        self.ledger.pending_count()
    }

    /// The current low-water-mark
    pub fn low_water_mark(&self) -> crate::foundation::types::GlobalTransactionId {
        self.tracker.low_water_mark()
    }

    async fn relay_batch(&self, batch: CommittedBatch) {
        let destinations: Vec<NodeId> = self.destinations.lock().iter().cloned().collect();

        let (global_ids, deltas) = self
            .tracker
            .assign(&batch.transactions, destinations.len());

        // Replicate any reservation extension before the ids appear in a
        // relay payload
        for delta in deltas {
            let message = GroupMessage::ClusterState(delta);
            match message.encode() {
                Ok(payload) => {
                    if let Err(e) = self.transport.broadcast(payload, message.kind()).await {
                        warn!("cluster state delta broadcast failed: {e}");
                    }
                }
                Err(e) => error!("failed to encode cluster state delta: {e}"),
            }
        }

        if destinations.is_empty() {
            // No replicas: the batch is as relayed as it will ever be
            self.txn_system.relay_complete(&batch.transactions);
            return;
        }

        for destination in destinations {
            self.ledger.record(&destination, &batch.transactions);

            let source = batch.source.clone();
            let payload = batch.payload.clone();
            let global_ids = global_ids.clone();
            let low_water_mark = self.tracker.low_water_mark();
            let result = self
                .data_sender
                .send(&destination, move |sequence| {
                    GroupMessage::Relay(RelayMessage::Commit(RelayedCommitBatch {
                        source,
                        payload,
                        global_ids,
                        sequence,
                        low_water_mark,
                    }))
                })
                .await;

            if let Err(e) = result {
                self.abandon_destination(
                    &destination,
                    ZapReason::CommunicationError,
                    format!("relay send failed: {e}"),
                )
                .await;
            } else {
                debug!(
                    "relayed {} transactions from {} to {destination}",
                    batch.transactions.len(),
                    batch.source
                );
            }
        }
    }

    /// Handle an inbound relay protocol message
    pub async fn handle_message(&self, from: &NodeId, message: RelayMessage) -> EngineResult<()> {
        match message {
            RelayMessage::Commit(batch) => self.handle_commit(from, batch).await,
            RelayMessage::Ack(ack) => self.handle_ack(ack),
        }
    }

    /// Passive side: apply a relayed batch and ack it
    async fn handle_commit(&self, from: &NodeId, batch: RelayedCommitBatch) -> EngineResult<()> {
        self.data_order.check(from, batch.sequence)?;

        let apply_mode = match *self.mode.borrow() {
            ServerMode::PassiveStandby => ApplyMode::Replicated,
            ServerMode::PassiveUninitialized => ApplyMode::ObjectSync,
            other => {
                return Err(Error::protocol(format!(
                    "relayed batch received in mode {other}"
                )));
            }
        };

        let applied = self.txn_system.apply_replicated(&batch, apply_mode).await?;
        self.txn_system.trim_below(batch.low_water_mark).await?;

        let txn_system = self.txn_system.clone();
        self.throttle
            .apply(move || txn_system.pending_transaction_count())
            .await;

        let ack = GroupMessage::Relay(RelayMessage::Ack(TransactionAck {
            destination: self.transport.local_node_id().clone(),
            acked: applied.into_iter().collect(),
        }));
        let payload = ack.encode()?;
        if let Err(e) = self.transport.send_to(from, payload, ack.kind()).await {
            self.zapper
                .zap(
                    from,
                    ZapReason::CommunicationToActiveError,
                    format!("ack send failed: {e}"),
                )
                .await;
        }
        Ok(())
    }

    /// Active side: resolve ledger entries for an ack
    fn handle_ack(&self, ack: TransactionAck) -> EngineResult<()> {
        let completed = self.ledger.ack(&ack.destination, ack.acked.iter());
        if !completed.is_empty() {
            self.tracker.complete(&completed);
            self.txn_system.relay_complete(&completed);
        }
        Ok(())
    }

    /// Purge all relay state for a departed destination
    pub fn handle_node_departed(&self, node: &NodeId) {
        self.destinations.lock().remove(node);
        let completed = self.ledger.resolve_destination(node);
        if !completed.is_empty() {
            info!(
                "resolved {} pending acks for departed {node}",
                completed.len()
            );
            self.tracker.complete(&completed);
            self.txn_system.relay_complete(&completed);
        }
    }

    async fn abandon_destination(&self, node: &NodeId, reason: ZapReason, cause: String) {
        self.handle_node_departed(node);
        self.zapper.zap(node, reason, cause).await;
    }
}

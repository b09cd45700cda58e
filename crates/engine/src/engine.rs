//! Engine orchestration
//!
//! Owns the services and the three background loops that connect them:
//! the dispatch loop (decodes incoming envelopes and routes them through a
//! single match; an undecodable or unknown message is fatal), the
//! membership loop (purges every per-node context when a member departs
//! and re-elects when the active is gone), and the event loop (routes
//! cross-service notifications: a joined passive gets a sync, a fully
//! synced passive gets promoted, a finished GC cycle kicks deferred
//! syncs).

use std::sync::Arc;

use futures::StreamExt;
use strata_topology::NodeId;
use strata_transport::{GroupTransport, MembershipEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineResult, Error};
use crate::foundation::cluster_state::{ClusterState, ClusterStateDelta};
use crate::foundation::messages::{GroupMessage, ZapNotice};
use crate::foundation::sequence::{SequenceChecker, SequencedSender};
use crate::foundation::traits::CommittedBatch;
use crate::foundation::types::{ChannelId, GlobalTransactionId, ObjectId, ServerMode};
use crate::services::EngineEvent;
use crate::services::election::ElectionManager;
use crate::services::gc::GcCoordinator;
use crate::services::relay::RelayService;
use crate::services::sync::StateSyncService;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Created but not started
    NotStarted,
    /// Background loops running
    Running,
    /// Shut down
    Stopped,
}

pub(crate) struct EngineShared {
    pub transport: Arc<dyn GroupTransport>,
    pub cluster_state: Arc<ClusterState>,
    pub election: Arc<ElectionManager>,
    pub sync: Arc<StateSyncService>,
    pub relay: Arc<RelayService>,
    pub gc: Arc<GcCoordinator>,
    pub data_sender: Arc<SequencedSender>,
    pub data_order: Arc<SequenceChecker>,
    pub mode_rx: watch::Receiver<ServerMode>,
    pub events_rx: flume::Receiver<EngineEvent>,
}

/// The replication engine
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) shared: Arc<EngineShared>,
    state: EngineState,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub(crate) fn new(config: EngineConfig, shared: Arc<EngineShared>) -> Self {
        Self {
            config,
            shared,
            state: EngineState::NotStarted,
            tasks: Vec::new(),
        }
    }

    /// The local node's identity
    pub fn node_id(&self) -> &NodeId {
        self.shared.transport.local_node_id()
    }

    /// The local node's current mode
    pub fn current_mode(&self) -> ServerMode {
        self.shared.election.current_mode()
    }

    /// Watch the local node's mode
    pub fn mode_receiver(&self) -> watch::Receiver<ServerMode> {
        self.shared.mode_rx.clone()
    }

    /// The node currently believed active
    pub fn active_node(&self) -> Option<NodeId> {
        self.shared.election.active_node()
    }

    /// The replicated cluster state
    pub fn cluster_state(&self) -> &ClusterState {
        &self.shared.cluster_state
    }

    /// Engine lifecycle state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The engine's configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the background loops and run the initial election
    pub async fn start(&mut self) -> EngineResult<()> {
        if self.state != EngineState::NotStarted {
            return Err(Error::invalid_state("engine already started"));
        }
        info!("starting replication engine as {}", self.node_id());

        self.tasks.extend(self.shared.sync.start());
        self.tasks.push(self.shared.relay.start());
        self.tasks.push(self.shared.gc.start());

        // Dispatch loop
        {
            let shared = self.shared.clone();
            let mut incoming = shared.transport.incoming();
            self.tasks.push(tokio::spawn(async move {
                while let Some(envelope) = incoming.next().await {
                    let sender = envelope.sender.clone();
                    if let Err(e) = shared.handle_envelope(envelope).await {
                        if e.is_fatal() {
                            error!("fatal protocol violation from {sender}: {e}; aborting");
                            shared.election.stop();
                            break;
                        }
                        warn!("error handling message from {sender}: {e}");
                    }
                }
                debug!("dispatch loop ended");
            }));
        }

        // Membership loop
        {
            let shared = self.shared.clone();
            let mut membership = shared.transport.membership_events();
            self.tasks.push(tokio::spawn(async move {
                while let Some(event) = membership.next().await {
                    shared.handle_membership_event(event).await;
                }
                debug!("membership loop ended");
            }));
        }

        // Event loop
        {
            let shared = self.shared.clone();
            self.tasks.push(tokio::spawn(async move {
                while let Ok(event) = shared.events_rx.recv_async().await {
                    shared.handle_event(event).await;
                }
                debug!("event loop ended");
            }));
        }

        self.shared.election.start_election();
        self.state = EngineState::Running;
        Ok(())
    }

    /// Stop the engine and leave the group
    pub async fn stop(&mut self) {
        if self.state != EngineState::Running {
            return;
        }
        info!("stopping replication engine {}", self.node_id());
        self.shared.election.stop();
        if let Err(e) = self.shared.transport.shutdown().await {
            warn!("transport shutdown failed: {e}");
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state = EngineState::Stopped;
    }

    /// Relay a locally committed batch to all passives (active only)
    pub async fn relay_committed(&self, batch: CommittedBatch) -> EngineResult<()> {
        if !self.current_mode().is_active() {
            return Err(Error::invalid_state(format!(
                "commits can only be relayed by the active (mode {})",
                self.current_mode()
            )));
        }
        self.shared.relay.submit(batch).await
    }

    /// Start a distributed GC cycle (active only)
    pub async fn start_gc_cycle(&self) -> EngineResult<bool> {
        self.shared.gc.start_cycle().await
    }

    /// Cancel the running GC cycle, if any
    pub async fn cancel_gc_cycle(&self) {
        self.shared.gc.cancel_cycle().await;
    }

    /// Allocate an object id and replicate the reservation (active only)
    pub async fn allocate_object_id(&self) -> EngineResult<ObjectId> {
        if !self.current_mode().is_active() {
            return Err(Error::invalid_state("only the active allocates object ids"));
        }
        let (id, delta) = self.shared.cluster_state.allocate_object_id();
        if let Some(delta) = delta {
            self.shared.broadcast_delta(delta).await;
        }
        Ok(id)
    }

    /// Record a new client connection and replicate it (active only)
    pub async fn connection_established(&self) -> EngineResult<ChannelId> {
        if !self.current_mode().is_active() {
            return Err(Error::invalid_state(
                "only the active tracks client connections",
            ));
        }
        let (channel, delta) = self.shared.cluster_state.connection_established();
        self.shared.broadcast_delta(delta).await;
        Ok(channel)
    }

    /// Record a destroyed client connection and replicate it (active only)
    pub async fn connection_destroyed(&self, channel: ChannelId) -> EngineResult<()> {
        if !self.current_mode().is_active() {
            return Err(Error::invalid_state(
                "only the active tracks client connections",
            ));
        }
        let delta = self.shared.cluster_state.connection_destroyed(channel);
        self.shared.broadcast_delta(delta).await;
        Ok(())
    }

    /// Transactions with at least one outstanding ack (active side)
    pub fn pending_acks(&self) -> usize {
        self.shared.relay.pending_acks()
    }

    /// The current low-water-mark (active side)
    pub fn low_water_mark(&self) -> GlobalTransactionId {
        self.shared.relay.low_water_mark()
    }
}

impl EngineShared {
    async fn handle_envelope(
        self: &Arc<Self>,
        envelope: strata_transport::GroupEnvelope,
    ) -> EngineResult<()> {
        let message = GroupMessage::decode(&envelope.payload)?;
        let from = &envelope.sender;
        match message {
            GroupMessage::Election(m) => self.election.handle_message(from, m).await,
            GroupMessage::ClusterState(delta) => {
                self.cluster_state.apply(delta);
                Ok(())
            }
            GroupMessage::ObjectSync(m) => self.sync.handle_object_message(from, m).await,
            GroupMessage::IndexSync(m) => self.sync.handle_index_message(from, m).await,
            GroupMessage::Relay(m) => self.relay.handle_message(from, m).await,
            GroupMessage::Gc(m) => self.gc.handle_message(from, m).await,
            GroupMessage::Zap(notice) => {
                self.handle_zap_notice(from, notice);
                Ok(())
            }
        }
    }

    fn handle_zap_notice(&self, from: &NodeId, notice: ZapNotice) {
        if notice.target == *self.transport.local_node_id() {
            error!(
                "zapped by {from}: {:?}: {}; leaving the cluster",
                notice.reason, notice.cause
            );
            self.election.stop();
        } else {
            info!(
                "{} zapped {} ({:?}: {})",
                from, notice.target, notice.reason, notice.cause
            );
        }
    }

    async fn handle_membership_event(self: &Arc<Self>, event: MembershipEvent) {
        match event {
            MembershipEvent::Joined(node) => {
                debug!("{node} joined the group");
                self.election.publish_active_state(&node).await;
            }
            MembershipEvent::Departed(node) => {
                info!("{node} left the group, purging its state");
                self.data_sender.clear(&node);
                self.data_order.clear(&node);
                self.sync.purge_node(&node);
                self.gc.sync_finished(&node);
                self.relay.handle_node_departed(&node);
                self.election.handle_node_departed(&node);
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::ModeChanged { old, new } => {
                debug!("mode changed {old} -> {new}");
            }
            EngineEvent::PassiveJoined(node) => {
                if !self.election.current_mode().is_active() {
                    return;
                }
                self.relay.add_destination(&node);
                if self.sync.is_synced_or_syncing(&node) {
                    debug!("{node} already synced or syncing");
                    return;
                }
                if self.gc.request_disable_for_sync(&node) {
                    self.sync.begin_sync(&node).await;
                }
            }
            EngineEvent::SyncAbandoned(node) => {
                self.gc.sync_finished(&node);
            }
            EngineEvent::NodeSyncComplete(node) => {
                self.election.move_node_to_passive_standby(&node).await;
                self.gc.sync_finished(&node);
            }
            EngineEvent::GcCycleCompleted { deferred } => {
                for node in deferred {
                    info!("GC cycle over, starting deferred sync for {node}");
                    if self.gc.request_disable_for_sync(&node) {
                        self.sync.begin_sync(&node).await;
                    }
                }
            }
        }
    }

    async fn broadcast_delta(&self, delta: ClusterStateDelta) {
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
}

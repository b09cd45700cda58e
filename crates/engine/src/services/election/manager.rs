//! Election state machine
//!
//! Any node that sees no active broadcasts `StartElection` with its
//! enrollment; peers answer `ElectionResult` ballots; after the election
//! window the highest enrollment wins. The winner declares itself with
//! `ElectionWon`, peers agree or force a re-run with `ResultConflict`, and
//! an established active answers any stray `StartElection` with
//! `AbortElection`. A node that wins nothing waits one window for the
//! winner to declare itself and re-runs otherwise.
//!
//! Every transition funnels through one place so the legal-transition
//! check cannot be bypassed.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use strata_topology::NodeId;
use strata_transport::GroupTransport;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ElectionConfig;
use crate::error::{EngineResult, Error};
use crate::foundation::enrollment::Enrollment;
use crate::foundation::messages::{
    ElectionMessage, ElectionMessageKind, GroupMessage, ZapReason,
};
use crate::foundation::types::ServerMode;
use crate::foundation::zap::Zapper;
use crate::services::EngineEvent;

struct ElectionState {
    mode: ServerMode,
    active_node: Option<NodeId>,
    /// Ballots collected for the election in progress
    ballots: Vec<Enrollment>,
    /// Guards stale election-window timers after a re-run
    epoch: u64,
    electing: bool,
}

/// The election manager
pub struct ElectionManager {
    config: ElectionConfig,
    transport: Arc<dyn GroupTransport>,
    zapper: Zapper,
    enrollment: Enrollment,
    state: Mutex<ElectionState>,
    mode_tx: watch::Sender<ServerMode>,
    events: flume::Sender<EngineEvent>,
}

impl ElectionManager {
    /// Create the election manager
    pub fn new(
        config: ElectionConfig,
        transport: Arc<dyn GroupTransport>,
        zapper: Zapper,
        enrollment: Enrollment,
        events: flume::Sender<EngineEvent>,
    ) -> (Arc<Self>, watch::Receiver<ServerMode>) {
        let (mode_tx, mode_rx) = watch::channel(ServerMode::Start);
        let manager = Arc::new(Self {
            config,
            transport,
            zapper,
            enrollment,
            state: Mutex::new(ElectionState {
                mode: ServerMode::Start,
                active_node: None,
                ballots: Vec::new(),
                epoch: 0,
                electing: false,
            }),
            mode_tx,
            events,
        });
        (manager, mode_rx)
    }

    /// The local node's current mode
    pub fn current_mode(&self) -> ServerMode {
        self.state.lock().mode
    }

    /// The node currently believed active (the local node when active)
    pub fn active_node(&self) -> Option<NodeId> {
        let state = self.state.lock();
        if state.mode.is_active() {
            Some(self.transport.local_node_id().clone())
        } else {
            state.active_node.clone()
        }
    }

    /// Transition to `new`, legal only from `valid_old`
    fn switch_to_state(
        &self,
        state: &mut ElectionState,
        new: ServerMode,
        valid_old: &[ServerMode],
    ) -> EngineResult<ServerMode> {
        let old = state.mode;
        if !valid_old.contains(&old) {
            return Err(Error::invalid_state(format!(
                "cannot move to {new} from {old}"
            )));
        }
        if old != new {
            state.mode = new;
            let _ = self.mode_tx.send(new);
            let _ = self.events.send(EngineEvent::ModeChanged { old, new });
            info!("moved to {new}");
        }
        Ok(old)
    }

    /// Start an election if this node has no active to follow
    pub fn start_election(self: &Arc<Self>) {
        let epoch = {
            let mut state = self.state.lock();
            if state.electing || state.active_node.is_some() || !state.mode.can_start_election() {
                debug!(
                    "not starting election (mode {}, electing {})",
                    state.mode, state.electing
                );
                return;
            }
            state.electing = true;
            state.ballots = vec![self.enrollment.clone()];
            state.epoch += 1;
            if state.mode == ServerMode::Start || state.mode == ServerMode::ElectionInProgress {
                let _ = self.switch_to_state(
                    &mut state,
                    ServerMode::ElectionInProgress,
                    &[ServerMode::Start, ServerMode::ElectionInProgress],
                );
            }
            state.epoch
        };

        info!("starting election with {}", self.enrollment);
        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .broadcast_election(ElectionMessageKind::StartElection)
                .await;
            tokio::time::sleep(manager.config.election_timeout).await;
            manager.finish_election(epoch).await;
        });
    }

    /// Close the ballot window for election `epoch` and act on the outcome
    async fn finish_election(self: &Arc<Self>, epoch: u64) {
        let won = {
            let mut state = self.state.lock();
            if !state.electing || state.epoch != epoch {
                return;
            }
            let winner = state.ballots.iter().max().cloned();
            let Some(winner) = winner else {
                state.electing = false;
                return;
            };
            if winner.node_id == *self.transport.local_node_id() {
                state.electing = false;
                state.active_node = None;
                if let Err(e) = self.switch_to_state(
                    &mut state,
                    ServerMode::Active,
                    &[ServerMode::ElectionInProgress, ServerMode::PassiveStandby],
                ) {
                    // An uninitialized passive cannot take the active
                    // role; the cluster waits for a node with data
                    error!("won the election but cannot take the active role: {e}");
                    return;
                }
                true
            } else {
                debug!("lost election to {winner}, waiting for it to declare");
                false
            }
        };

        if won {
            info!("won election, declaring with {}", self.enrollment);
            self.broadcast_election(ElectionMessageKind::ElectionWon)
                .await;
        } else {
            // Wait one more window for the winner's declaration; if it
            // never comes, re-run
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(manager.config.election_timeout).await;
                let rerun = {
                    let mut state = manager.state.lock();
                    if state.epoch == epoch && state.electing && state.active_node.is_none() {
                        state.electing = false;
                        true
                    } else {
                        false
                    }
                };
                if rerun {
                    warn!("winner never declared itself, re-running election");
                    let jitter = rand::thread_rng().gen_range(0..50);
                    tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
                    manager.start_election();
                }
            });
        }
    }

    /// Handle an inbound election protocol message
    pub async fn handle_message(
        self: &Arc<Self>,
        from: &NodeId,
        message: ElectionMessage,
    ) -> EngineResult<()> {
        debug!("election message {:?} from {from}", message.kind);
        match message.kind {
            ElectionMessageKind::StartElection => {
                self.handle_start_election(from, message.enrollment).await
            }
            ElectionMessageKind::ElectionResult => {
                self.handle_election_result(from, message.enrollment).await
            }
            ElectionMessageKind::ResultAgreed => self.handle_result_agreed(from),
            ElectionMessageKind::ResultConflict => {
                self.handle_result_conflict(from, message.enrollment).await
            }
            ElectionMessageKind::AbortElection => {
                self.handle_abort_election(from, message.enrollment).await
            }
            ElectionMessageKind::ElectionWon | ElectionMessageKind::ElectionWonAlready => {
                self.handle_election_won(from, message).await
            }
            ElectionMessageKind::MoveToPassiveStandby => self.handle_move_to_standby(from),
        }
    }

    async fn handle_start_election(
        self: &Arc<Self>,
        from: &NodeId,
        enrollment: Enrollment,
    ) -> EngineResult<()> {
        if self.current_mode().is_active() {
            // A new node or a renegade candidate: force it to stand down
            info!("forcing {from} to abort its election");
            self.send_election(from, ElectionMessageKind::AbortElection)
                .await;
            return Ok(());
        }

        self.send_election(from, ElectionMessageKind::ElectionResult)
            .await;

        // Another node sees no active; if this node also sees none, run
        // its own election so every candidate collects ballots
        let should_elect = {
            let state = self.state.lock();
            state.active_node.is_none() && !state.electing && state.mode.can_start_election()
        };
        if should_elect {
            self.start_election();
        }

        // The opener is a candidate too: cast its enrollment into the
        // election in progress here
        let mut state = self.state.lock();
        if state.electing {
            state.ballots.push(enrollment);
        }
        Ok(())
    }

    async fn handle_election_result(
        self: &Arc<Self>,
        from: &NodeId,
        enrollment: Enrollment,
    ) -> EngineResult<()> {
        enum Reply {
            Agreed,
            Conflict,
            None,
        }
        let reply = {
            let mut state = self.state.lock();
            if state.active_node.as_ref() == Some(&enrollment.node_id) {
                Reply::Agreed
            } else if state.mode.is_active() || state.active_node.is_some() {
                warn!(
                    "ballot from {from} while following {:?}, forcing re-election",
                    state.active_node
                );
                Reply::Conflict
            } else if state.electing {
                state.ballots.push(enrollment);
                Reply::None
            } else {
                debug!("ignoring stray ballot from {from}");
                Reply::None
            }
        };
        match reply {
            Reply::Agreed => {
                self.send_election(from, ElectionMessageKind::ResultAgreed)
                    .await
            }
            Reply::Conflict => {
                self.send_election(from, ElectionMessageKind::ResultConflict)
                    .await
            }
            Reply::None => {}
        }
        Ok(())
    }

    fn handle_result_agreed(&self, from: &NodeId) -> EngineResult<()> {
        if self.current_mode().is_active() {
            // The peer follows this active now and needs a full sync
            let _ = self.events.send(EngineEvent::PassiveJoined(from.clone()));
        }
        Ok(())
    }

    async fn handle_result_conflict(
        self: &Arc<Self>,
        from: &NodeId,
        enrollment: Enrollment,
    ) -> EngineResult<()> {
        let mode = self.current_mode();
        if mode.is_active() {
            // Either a racing election's loser or a genuine second active.
            // The enrollment order decides who survives; the loser expects
            // to be zapped by the winner.
            if self.enrollment.wins_over(&enrollment) {
                self.zapper
                    .zap(
                        from,
                        ZapReason::SplitBrain,
                        format!("{} wins over {}", self.enrollment, enrollment),
                    )
                    .await;
            } else {
                warn!("conflicting active {from} outranks this node, standing by for zap");
            }
        } else {
            debug!("conflict notice from {from} ignored in mode {mode}");
        }
        Ok(())
    }

    async fn handle_abort_election(
        self: &Arc<Self>,
        from: &NodeId,
        enrollment: Enrollment,
    ) -> EngineResult<()> {
        info!("election aborted by active {from}");
        self.accept_active(from, &enrollment)?;
        self.send_election(from, ElectionMessageKind::ResultAgreed)
            .await;
        Ok(())
    }

    async fn handle_election_won(
        self: &Arc<Self>,
        from: &NodeId,
        message: ElectionMessage,
    ) -> EngineResult<()> {
        let enrollment = message.enrollment;
        if self.current_mode().is_active() {
            warn!("split-brain detected: {from} also claims active");
            if self.enrollment.wins_over(&enrollment) {
                self.zapper
                    .zap(
                        from,
                        ZapReason::SplitBrain,
                        format!("{} wins over {}", self.enrollment, enrollment),
                    )
                    .await;
            } else {
                error!("yielding to {from}: {} outranks {}", enrollment, self.enrollment);
                let mut state = self.state.lock();
                let _ = self.switch_to_state(
                    &mut state,
                    ServerMode::Stopped,
                    &[ServerMode::Active],
                );
            }
            return Ok(());
        }

        if message.kind == ElectionMessageKind::ElectionWonAlready {
            // An established active publishing its state: accept unless
            // this node already follows a different active
            let conflicting = {
                let state = self.state.lock();
                state
                    .active_node
                    .as_ref()
                    .is_some_and(|active| active != from)
            };
            if conflicting {
                warn!("{from} claims active but this node follows another");
                self.send_election(from, ElectionMessageKind::ResultConflict)
                    .await;
                return Ok(());
            }
        } else if !enrollment.wins_over(&self.enrollment) {
            // A freshly declared winner must actually beat this
            // candidate's credential
            warn!(
                "rejecting winner {from}: {} does not beat {}",
                enrollment, self.enrollment
            );
            self.send_election(from, ElectionMessageKind::ResultConflict)
                .await;
            return Ok(());
        }

        self.accept_active(from, &enrollment)?;
        self.send_election(from, ElectionMessageKind::ResultAgreed)
            .await;
        Ok(())
    }

    fn handle_move_to_standby(&self, from: &NodeId) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.active_node.as_ref() != Some(from) {
            return Err(Error::protocol(format!(
                "standby promotion from {from}, which is not the active"
            )));
        }
        match state.mode {
            ServerMode::PassiveUninitialized => {
                self.switch_to_state(
                    &mut state,
                    ServerMode::PassiveStandby,
                    &[ServerMode::PassiveUninitialized],
                )?;
                Ok(())
            }
            ServerMode::PassiveStandby => {
                debug!("already in {}", state.mode);
                Ok(())
            }
            other => Err(Error::protocol(format!(
                "standby promotion received in mode {other}"
            ))),
        }
    }

    /// Record `from` as the active and become its passive
    fn accept_active(&self, from: &NodeId, enrollment: &Enrollment) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.electing = false;
        state.epoch += 1;
        state.ballots.clear();
        state.active_node = Some(from.clone());
        debug!("accepted {from} as active ({enrollment})");
        if state.mode != ServerMode::PassiveStandby {
            self.switch_to_state(
                &mut state,
                ServerMode::PassiveUninitialized,
                &[
                    ServerMode::Start,
                    ServerMode::ElectionInProgress,
                    ServerMode::PassiveUninitialized,
                ],
            )?;
        }
        Ok(())
    }

    /// Active side: publish active state to a newly joined node
    pub async fn publish_active_state(self: &Arc<Self>, node: &NodeId) {
        if !self.current_mode().is_active() {
            return;
        }
        debug!("publishing active state to {node}");
        self.send_election(node, ElectionMessageKind::ElectionWonAlready)
            .await;
    }

    /// Active side: promote a fully synced passive
    pub async fn move_node_to_passive_standby(self: &Arc<Self>, node: &NodeId) {
        info!("promoting {node} to PASSIVE-STANDBY");
        self.send_election(node, ElectionMessageKind::MoveToPassiveStandby)
            .await;
    }

    /// React to a membership departure
    pub fn handle_node_departed(self: &Arc<Self>, node: &NodeId) {
        let elect = {
            let mut state = self.state.lock();
            if state.active_node.as_ref() == Some(node) {
                warn!("active {node} departed");
                state.active_node = None;
                state.electing = false;
                !state.mode.is_active()
            } else {
                false
            }
        };
        if elect {
            info!("starting election to replace departed active");
            self.start_election();
        }
    }

    /// Move to the terminal state
    pub fn stop(&self) {
        let mut state = self.state.lock();
        let old = state.mode;
        if old != ServerMode::Stopped {
            state.mode = ServerMode::Stopped;
            let _ = self.mode_tx.send(ServerMode::Stopped);
            let _ = self.events.send(EngineEvent::ModeChanged {
                old,
                new: ServerMode::Stopped,
            });
            info!("moved to {}", ServerMode::Stopped);
        }
    }

    async fn broadcast_election(&self, kind: ElectionMessageKind) {
        let message = GroupMessage::Election(ElectionMessage::new(kind, self.enrollment.clone()));
        match message.encode() {
            Ok(payload) => {
                if let Err(e) = self.transport.broadcast(payload, message.kind()).await {
                    warn!("election broadcast failed: {e}");
                }
            }
            Err(e) => error!("failed to encode election message: {e}"),
        }
    }

    /// Send an election message; an unreachable peer is zapped so the
    /// election completes among the reachable ones
    async fn send_election(self: &Arc<Self>, to: &NodeId, kind: ElectionMessageKind) {
        let message = GroupMessage::Election(ElectionMessage::new(kind, self.enrollment.clone()));
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode election message: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.send_to(to, payload, message.kind()).await {
            self.zapper
                .zap(
                    to,
                    ZapReason::CommunicationError,
                    format!("election send failed: {e}"),
                )
                .await;
        }
    }
}

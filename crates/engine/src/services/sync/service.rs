//! Object and index sync pipelines
//!
//! Two structurally identical pipelines drive a joining passive from
//! uninitialized to standby-ready, each in four stages per destination:
//! Request (pull the next not-yet-sent units from the cursor), Dehydrate
//! (serialize them, with the object store releasing its objects before the
//! payload leaves the stage), Send (transmit, zap-and-abandon on failure),
//! and Complete/Ack (a completion message once the cursor drains, marked
//! done only when the destination acks it).
//!
//! The stages are global workers over bounded queues; per-destination
//! state lives in the context map. Stages never call each other: they
//! hand off by enqueuing the next stage's input.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use strata_topology::NodeId;
use strata_transport::GroupTransport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::context::NodeSyncState;
use crate::config::SyncConfig;
use crate::error::{EngineResult, Error};
use crate::foundation::cluster_state::ClusterState;
use crate::foundation::messages::{
    GroupMessage, IndexSyncFile, IndexSyncMessage, ObjectSyncBatch, ObjectSyncMessage, ZapReason,
};
use crate::foundation::sequence::{SequenceChecker, SequencedSender};
use crate::foundation::traits::{IndexFileRef, IndexSource, ObjectSource};
use crate::foundation::types::{ObjectId, SequenceId, ServerMode};
use crate::foundation::zap::Zapper;
use crate::services::EngineEvent;

/// Object pipeline, dehydrate stage input
enum ObjectJob {
    Batch { node: NodeId, ids: Vec<ObjectId> },
    Complete { node: NodeId },
}

/// Object pipeline, send stage input
struct ObjectSendJob {
    node: NodeId,
    message: ObjectOutbound,
}

enum ObjectOutbound {
    Batch(ObjectSyncBatch),
    Complete,
}

/// Index pipeline, dehydrate stage input
enum IndexJob {
    Start { node: NodeId, file_count: usize },
    File { node: NodeId, file: IndexFileRef },
    Complete { node: NodeId },
}

/// Index pipeline, send stage input
struct IndexSendJob {
    node: NodeId,
    message: IndexOutbound,
}

enum IndexOutbound {
    Start { file_count: usize },
    File(IndexSyncFile),
    Complete,
}

/// One pipeline's stage queues
struct PipelineQueues<Request, Dehydrate, Outbound> {
    request_tx: flume::Sender<Request>,
    request_rx: flume::Receiver<Request>,
    dehydrate_tx: flume::Sender<Dehydrate>,
    dehydrate_rx: flume::Receiver<Dehydrate>,
    send_tx: flume::Sender<Outbound>,
    send_rx: flume::Receiver<Outbound>,
}

impl<Request, Dehydrate, Outbound> PipelineQueues<Request, Dehydrate, Outbound> {
    fn bounded(capacity: usize) -> Self {
        let (request_tx, request_rx) = flume::bounded(capacity);
        let (dehydrate_tx, dehydrate_rx) = flume::bounded(capacity);
        let (send_tx, send_rx) = flume::bounded(capacity);
        Self {
            request_tx,
            request_rx,
            dehydrate_tx,
            dehydrate_rx,
            send_tx,
            send_rx,
        }
    }
}

/// The state sync service
pub struct StateSyncService {
    config: SyncConfig,
    transport: Arc<dyn GroupTransport>,
    zapper: Zapper,
    object_source: Arc<dyn ObjectSource>,
    index_source: Arc<dyn IndexSource>,
    cluster_state: Arc<ClusterState>,
    /// Sequence space shared with the relay pipeline
    data_sender: Arc<SequencedSender>,
    index_sender: Arc<SequencedSender>,
    /// Inbound check for the active's data stream, shared with relay
    data_order: Arc<SequenceChecker>,
    index_order: SequenceChecker,
    mode: watch::Receiver<ServerMode>,
    contexts: Mutex<HashMap<NodeId, NodeSyncState>>,
    /// Destinations that completed a sync and reached standby
    synced: Mutex<HashSet<NodeId>>,
    /// Passive side: set once a sync has begun in this incarnation
    synced_once: AtomicBool,
    events: flume::Sender<EngineEvent>,
    /// The two pipelines are independent: a stall in one never delays
    /// the other
    objects: PipelineQueues<NodeId, ObjectJob, ObjectSendJob>,
    indexes: PipelineQueues<NodeId, IndexJob, IndexSendJob>,
}

impl StateSyncService {
    /// Create the sync service
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        queue_capacity: usize,
        transport: Arc<dyn GroupTransport>,
        zapper: Zapper,
        object_source: Arc<dyn ObjectSource>,
        index_source: Arc<dyn IndexSource>,
        cluster_state: Arc<ClusterState>,
        data_sender: Arc<SequencedSender>,
        data_order: Arc<SequenceChecker>,
        mode: watch::Receiver<ServerMode>,
        events: flume::Sender<EngineEvent>,
    ) -> Self {
        let index_sender = Arc::new(SequencedSender::new(transport.clone()));
        Self {
            config,
            transport,
            zapper,
            object_source,
            index_source,
            cluster_state,
            data_sender,
            index_sender,
            data_order,
            index_order: SequenceChecker::new(),
            mode,
            contexts: Mutex::new(HashMap::new()),
            synced: Mutex::new(HashSet::new()),
            synced_once: AtomicBool::new(false),
            events,
            objects: PipelineQueues::bounded(queue_capacity),
            indexes: PipelineQueues::bounded(queue_capacity),
        }
    }

    /// Spawn the stage workers, three per pipeline
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut workers = Vec::new();
        {
            let service = self.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(node) = service.objects.request_rx.recv_async().await {
                    service.run_object_request_stage(node).await;
                }
            }));
        }
        {
            let service = self.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(job) = service.objects.dehydrate_rx.recv_async().await {
                    service.run_object_dehydrate_stage(job).await;
                }
            }));
        }
        {
            let service = self.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(job) = service.objects.send_rx.recv_async().await {
                    service.run_object_send_stage(job).await;
                }
            }));
        }
        {
            let service = self.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(node) = service.indexes.request_rx.recv_async().await {
                    service.run_index_request_stage(node).await;
                }
            }));
        }
        {
            let service = self.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(job) = service.indexes.dehydrate_rx.recv_async().await {
                    service.run_index_dehydrate_stage(job).await;
                }
            }));
        }
        {
            let service = self.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(job) = service.indexes.send_rx.recv_async().await {
                    service.run_index_send_stage(job).await;
                }
            }));
        }
        workers
    }

    /// Active side: open the sync handshake with a joining passive
    ///
    /// Idempotent: a destination already being synced is left alone.
    pub async fn begin_sync(self: &Arc<Self>, node: &NodeId) {
        {
            let mut contexts = self.contexts.lock();
            if contexts.contains_key(node) {
                debug!("sync for {node} already initiated, ignoring");
                return;
            }
            contexts.insert(node.clone(), NodeSyncState::default());
        }
        info!("asking {node} whether a full sync may begin");
        let message = GroupMessage::ObjectSync(ObjectSyncMessage::Begin);
        if let Err(e) = self.send_control(node, &message).await {
            self.abandon(node, format!("sync begin send failed: {e}"))
                .await;
        }
    }

    /// Handle an inbound object sync protocol message
    pub async fn handle_object_message(
        self: &Arc<Self>,
        from: &NodeId,
        message: ObjectSyncMessage,
    ) -> EngineResult<()> {
        match message {
            ObjectSyncMessage::Begin => self.handle_begin(from).await,
            ObjectSyncMessage::BeginResponse {
                current_mode,
                sync_allowed,
            } => self.handle_begin_response(from, current_mode, sync_allowed).await,
            ObjectSyncMessage::Batch(batch) => self.handle_object_batch(from, batch).await,
            ObjectSyncMessage::Complete { sequence } => {
                self.handle_object_complete(from, sequence).await
            }
            ObjectSyncMessage::CompleteAck { .. } => {
                self.handle_complete_ack(from, PayloadKind::Object)
            }
        }
    }

    /// Handle an inbound index sync protocol message
    pub async fn handle_index_message(
        self: &Arc<Self>,
        from: &NodeId,
        message: IndexSyncMessage,
    ) -> EngineResult<()> {
        match message {
            IndexSyncMessage::Start {
                sequence,
                file_count,
            } => {
                self.index_order.check(from, sequence)?;
                info!("index sync started: expecting {file_count} files from {from}");
                Ok(())
            }
            IndexSyncMessage::File(file) => {
                self.index_order.check(from, file.sequence)?;
                self.index_source.apply_file(&file).await
            }
            IndexSyncMessage::Complete { sequence } => {
                self.index_order.check(from, sequence)?;
                let ack =
                    GroupMessage::IndexSync(IndexSyncMessage::CompleteAck { sequence });
                self.reply_to_active(from, &ack).await;
                Ok(())
            }
            IndexSyncMessage::CompleteAck { .. } => {
                self.handle_complete_ack(from, PayloadKind::Index)
            }
        }
    }

    /// Whether a destination is mid-sync or already standby-ready
    pub fn is_synced_or_syncing(&self, node: &NodeId) -> bool {
        self.contexts.lock().contains_key(node) || self.synced.lock().contains(node)
    }

    /// Discard all sync state for a departed destination
    ///
    /// Returns true when a sync was actually in progress; resuming after a
    /// reconnect always means a fresh full sync.
    pub fn purge_node(&self, node: &NodeId) -> bool {
        let was_syncing = self.contexts.lock().remove(node).is_some();
        self.synced.lock().remove(node);
        self.index_sender.clear(node);
        self.index_order.clear(node);
        if was_syncing {
            info!("discarded sync context for {node}");
        }
        was_syncing
    }

    // --- Active-side object pipeline ---

    async fn run_object_request_stage(&self, node: NodeId) {
        let job = {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(&node) else {
                return;
            };
            let take = self.config.batch_size.min(ctx.object.remaining.len());
            if take == 0 {
                ObjectJob::Complete { node }
            } else {
                let ids: Vec<ObjectId> = ctx.object.remaining.drain(..take).collect();
                ObjectJob::Batch { node, ids }
            }
        };
        let _ = self.objects.dehydrate_tx.send_async(job).await;
    }

    async fn run_object_dehydrate_stage(&self, job: ObjectJob) {
        let send_job = match job {
            ObjectJob::Batch { node, ids } => match self.object_source.dehydrate(&ids).await {
                Ok(batch) => ObjectSendJob {
                    node,
                    message: ObjectOutbound::Batch(ObjectSyncBatch {
                        object_ids: ids.iter().copied().collect(),
                        unit_count: ids.len(),
                        payload: batch.payload,
                        string_dictionary: batch.string_dictionary,
                        roots: batch.roots,
                        // Assigned by the send stage
                        sequence: SequenceId::default(),
                    }),
                },
                Err(e) => {
                    self.abandon(&node, format!("object dehydrate failed: {e}"))
                        .await;
                    return;
                }
            },
            ObjectJob::Complete { node } => ObjectSendJob {
                node,
                message: ObjectOutbound::Complete,
            },
        };
        let _ = self.objects.send_tx.send_async(send_job).await;
    }

    async fn run_object_send_stage(&self, job: ObjectSendJob) {
        let ObjectSendJob { node, message } = job;
        let rearm = matches!(message, ObjectOutbound::Batch(_));
        let result = self
            .data_sender
            .send(&node, move |sequence| match message {
                ObjectOutbound::Batch(mut batch) => {
                    batch.sequence = sequence;
                    GroupMessage::ObjectSync(ObjectSyncMessage::Batch(batch))
                }
                ObjectOutbound::Complete => {
                    GroupMessage::ObjectSync(ObjectSyncMessage::Complete { sequence })
                }
            })
            .await;
        match result {
            Ok(()) => {
                if rearm {
                    // Pace batches so a recovering passive is not saturated
                    tokio::time::sleep(self.config.inter_batch_delay).await;
                    let _ = self.objects.request_tx.send_async(node).await;
                } else {
                    debug!("object sync complete message sent to {node}");
                }
            }
            Err(e) => {
                self.abandon(&node, format!("object sync send failed: {e}"))
                    .await;
            }
        }
    }

    // --- Active-side index pipeline ---

    async fn run_index_request_stage(&self, node: NodeId) {
        let job = {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(&node) else {
                return;
            };
            if !ctx.index.started {
                ctx.index.started = true;
                IndexJob::Start {
                    node,
                    file_count: ctx.index.total,
                }
            } else {
                match ctx.index.remaining.pop_front() {
                    Some(file) => IndexJob::File { node, file },
                    None => IndexJob::Complete { node },
                }
            }
        };
        let _ = self.indexes.dehydrate_tx.send_async(job).await;
    }

    async fn run_index_dehydrate_stage(&self, job: IndexJob) {
        let send_job = match job {
            IndexJob::Start { node, file_count } => IndexSendJob {
                node,
                message: IndexOutbound::Start { file_count },
            },
            IndexJob::File { node, file } => match self.index_source.read_file(&file).await {
                Ok(contents) => IndexSendJob {
                    node,
                    message: IndexOutbound::File(IndexSyncFile {
                        index_name: file.index_name,
                        file_name: file.file_name,
                        byte_length: contents.len(),
                        contents,
                        // Assigned by the send stage
                        sequence: SequenceId::default(),
                    }),
                },
                Err(e) => {
                    self.abandon(&node, format!("index file read failed: {e}"))
                        .await;
                    return;
                }
            },
            IndexJob::Complete { node } => IndexSendJob {
                node,
                message: IndexOutbound::Complete,
            },
        };
        let _ = self.indexes.send_tx.send_async(send_job).await;
    }

    async fn run_index_send_stage(&self, job: IndexSendJob) {
        let IndexSendJob { node, message } = job;
        let rearm = !matches!(message, IndexOutbound::Complete);
        let result = self
            .index_sender
            .send(&node, move |sequence| match message {
                IndexOutbound::Start { file_count } => {
                    GroupMessage::IndexSync(IndexSyncMessage::Start {
                        sequence,
                        file_count,
                    })
                }
                IndexOutbound::File(mut file) => {
                    file.sequence = sequence;
                    GroupMessage::IndexSync(IndexSyncMessage::File(file))
                }
                IndexOutbound::Complete => {
                    GroupMessage::IndexSync(IndexSyncMessage::Complete { sequence })
                }
            })
            .await;
        match result {
            Ok(()) => {
                if rearm {
                    let _ = self.indexes.request_tx.send_async(node).await;
                } else {
                    debug!("index sync complete message sent to {node}");
                }
            }
            Err(e) => {
                self.abandon(&node, format!("index sync send failed: {e}"))
                    .await;
            }
        }
    }

    // --- Handshake and completion ---

    /// Passive side: the active asks to begin a full sync
    async fn handle_begin(self: &Arc<Self>, from: &NodeId) -> EngineResult<()> {
        let mode = *self.mode.borrow();
        if mode.is_active() {
            // Two actives after a partition; resolve through the zap policy
            self.zapper
                .zap(
                    from,
                    ZapReason::SplitBrain,
                    "sync begin received while active",
                )
                .await;
            return Ok(());
        }
        let sync_allowed = !self.synced_once.swap(true, Ordering::SeqCst);
        if !sync_allowed {
            warn!("refusing second sync in this incarnation");
        }
        let response = GroupMessage::ObjectSync(ObjectSyncMessage::BeginResponse {
            current_mode: mode,
            sync_allowed,
        });
        self.reply_to_active(from, &response).await;
        Ok(())
    }

    /// Active side: the passive answered the begin handshake
    async fn handle_begin_response(
        self: &Arc<Self>,
        from: &NodeId,
        current_mode: ServerMode,
        sync_allowed: bool,
    ) -> EngineResult<()> {
        if !sync_allowed {
            self.contexts.lock().remove(from);
            if current_mode == ServerMode::PassiveStandby {
                // Failover: the peer was standby under the previous
                // active and already holds the full replicated state
                info!("{from} is already standby, skipping full sync");
                self.synced.lock().insert(from.clone());
                let _ = self.events.send(EngineEvent::NodeSyncComplete(from.clone()));
            } else {
                self.zapper
                    .zap(
                        from,
                        ZapReason::DirtyDatabase,
                        "node rejoined with stale replicated state and must restart",
                    )
                    .await;
                let _ = self.events.send(EngineEvent::SyncAbandoned(from.clone()));
            }
            return Ok(());
        }

        let object_ids = match self.object_source.object_ids().await {
            Ok(ids) => ids,
            Err(e) => return Err(Error::sync(format!("object id snapshot failed: {e}"))),
        };
        let index_files = match self.index_source.index_files().await {
            Ok(files) => files,
            Err(e) => return Err(Error::sync(format!("index enumeration failed: {e}"))),
        };

        {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(from) else {
                debug!("begin response from {from} without a pending sync");
                return Ok(());
            };
            if ctx.begun {
                debug!("duplicate begin response from {from}");
                return Ok(());
            }
            ctx.begun = true;
            ctx.object.total = object_ids.len();
            ctx.object.remaining = object_ids.into_iter().collect();
            ctx.index.total = index_files.len();
            ctx.index.remaining = index_files.into_iter().collect();
            info!(
                "starting full sync for {from} (mode {current_mode}): {} objects, {} index files",
                ctx.object.total, ctx.index.total
            );
        }

        // The joiner needs the replicated counters before any data arrives
        let snapshot = GroupMessage::ClusterState(self.cluster_state.snapshot());
        if let Err(e) = self.send_control(from, &snapshot).await {
            self.abandon(from, format!("cluster state send failed: {e}"))
                .await;
            return Ok(());
        }

        let _ = self.objects.request_tx.send_async(from.clone()).await;
        let _ = self.indexes.request_tx.send_async(from.clone()).await;
        Ok(())
    }

    /// Passive side: apply one object batch
    async fn handle_object_batch(
        &self,
        from: &NodeId,
        batch: ObjectSyncBatch,
    ) -> EngineResult<()> {
        self.data_order.check(from, batch.sequence)?;
        debug!(
            "applying object sync batch of {} from {from}",
            batch.unit_count
        );
        self.object_source.apply_sync_batch(&batch).await
    }

    /// Passive side: the active has no more objects for us
    async fn handle_object_complete(
        self: &Arc<Self>,
        from: &NodeId,
        sequence: SequenceId,
    ) -> EngineResult<()> {
        self.data_order.check(from, sequence)?;
        let ack = GroupMessage::ObjectSync(ObjectSyncMessage::CompleteAck { sequence });
        self.reply_to_active(from, &ack).await;
        Ok(())
    }

    /// Active side: a destination acknowledged one pipeline's completion
    fn handle_complete_ack(&self, from: &NodeId, kind: PayloadKind) -> EngineResult<()> {
        let finished = {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(from) else {
                debug!("completion ack from {from} without a sync context");
                return Ok(());
            };
            match kind {
                PayloadKind::Object => ctx.object_complete = true,
                PayloadKind::Index => ctx.index_complete = true,
            }
            info!("{kind:?} sync complete for {from}");
            if ctx.is_complete() {
                contexts.remove(from);
                self.synced.lock().insert(from.clone());
                true
            } else {
                false
            }
        };
        if finished {
            info!("both sync pipelines complete for {from}");
            let _ = self.events.send(EngineEvent::NodeSyncComplete(from.clone()));
        }
        Ok(())
    }

    // --- Helpers ---

    async fn send_control(&self, node: &NodeId, message: &GroupMessage) -> EngineResult<()> {
        let payload = message.encode()?;
        self.transport
            .send_to(node, payload, message.kind())
            .await?;
        Ok(())
    }

    /// Passive-to-active reply; a failure zaps the active
    async fn reply_to_active(&self, active: &NodeId, message: &GroupMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode sync reply: {e}");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .send_to(active, payload, message.kind())
            .await
        {
            self.zapper
                .zap(
                    active,
                    ZapReason::CommunicationToActiveError,
                    format!("sync reply send failed: {e}"),
                )
                .await;
        }
    }

    /// Abandon a destination's sync: discard its contexts, tell the
    /// engine, and zap it
    async fn abandon(&self, node: &NodeId, cause: String) {
        self.purge_node(node);
        let _ = self.events.send(EngineEvent::SyncAbandoned(node.clone()));
        self.zapper
            .zap(node, ZapReason::CommunicationError, cause)
            .await;
    }
}

#[derive(Debug, Clone, Copy)]
enum PayloadKind {
    Object,
    Index,
}

//! Builder for the replication engine
//!
//! All collaborators are injected here and threaded down through
//! constructors; the engine keeps no global mutable state.

use std::sync::Arc;

use strata_transport::GroupTransport;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineShared};
use crate::error::{EngineResult, Error};
use crate::foundation::cluster_state::ClusterState;
use crate::foundation::enrollment::Enrollment;
use crate::foundation::sequence::{SequenceChecker, SequencedSender};
use crate::foundation::traits::{IndexSource, ObjectSource, TransactionSystem};
use crate::foundation::zap::Zapper;
use crate::services::election::ElectionManager;
use crate::services::gc::GcCoordinator;
use crate::services::relay::{GlobalTransactionTracker, RelayService};
use crate::services::sync::StateSyncService;

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn GroupTransport>>,
    object_source: Option<Arc<dyn ObjectSource>>,
    index_source: Option<Arc<dyn IndexSource>>,
    transaction_system: Option<Arc<dyn TransactionSystem>>,
    has_data: bool,
    cluster_id: Option<Uuid>,
}

impl EngineBuilder {
    /// Create a builder with the given configuration
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
            object_source: None,
            index_source: None,
            transaction_system: None,
            has_data: false,
            cluster_id: None,
        }
    }

    /// Set the group transport
    pub fn with_transport(mut self, transport: Arc<dyn GroupTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the object graph engine
    pub fn with_object_source(mut self, source: Arc<dyn ObjectSource>) -> Self {
        self.object_source = Some(source);
        self
    }

    /// Set the search index store
    pub fn with_index_source(mut self, source: Arc<dyn IndexSource>) -> Self {
        self.index_source = Some(source);
        self
    }

    /// Set the local transaction system
    pub fn with_transaction_system(mut self, system: Arc<dyn TransactionSystem>) -> Self {
        self.transaction_system = Some(system);
        self
    }

    /// Declare whether this node already holds replicated data; a fresh
    /// node enrolls as a new candidate and cannot win over enrolled ones
    pub fn with_existing_data(mut self, has_data: bool) -> Self {
        self.has_data = has_data;
        self
    }

    /// Set the cluster identifier (defaults to a fresh one)
    pub fn with_cluster_id(mut self, cluster_id: Uuid) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    /// Build the engine
    pub fn build(self) -> EngineResult<Engine> {
        let transport = self
            .transport
            .ok_or_else(|| Error::configuration("group transport is required"))?;
        let object_source = self
            .object_source
            .ok_or_else(|| Error::configuration("object source is required"))?;
        let index_source = self
            .index_source
            .ok_or_else(|| Error::configuration("index source is required"))?;
        let transaction_system = self
            .transaction_system
            .ok_or_else(|| Error::configuration("transaction system is required"))?;

        let config = self.config;
        let local_id = transport.local_node_id().clone();
        let enrollment = Enrollment::new(
            local_id,
            !self.has_data,
            config.election.enrollment_weight,
        );

        let zapper = Zapper::new(transport.clone());
        let cluster_state = Arc::new(ClusterState::new(
            self.cluster_id.unwrap_or_else(Uuid::new_v4),
        ));
        let data_sender = Arc::new(SequencedSender::new(transport.clone()));
        let data_order = Arc::new(SequenceChecker::new());
        let tracker = Arc::new(GlobalTransactionTracker::new(cluster_state.clone()));

        // Control-plane notifications; unbounded so services can emit
        // while holding their own locks
        let (events_tx, events_rx) = flume::unbounded();

        let (election, mode_rx) = ElectionManager::new(
            config.election.clone(),
            transport.clone(),
            zapper.clone(),
            enrollment,
            events_tx.clone(),
        );

        let sync = Arc::new(StateSyncService::new(
            config.sync.clone(),
            config.stage_queue_capacity,
            transport.clone(),
            zapper.clone(),
            object_source.clone(),
            index_source,
            cluster_state.clone(),
            data_sender.clone(),
            data_order.clone(),
            mode_rx.clone(),
            events_tx.clone(),
        ));

        let relay = Arc::new(RelayService::new(
            &config.relay,
            config.stage_queue_capacity,
            transport.clone(),
            zapper.clone(),
            transaction_system.clone(),
            data_sender.clone(),
            data_order.clone(),
            tracker,
            mode_rx.clone(),
        ));

        let gc = Arc::new(GcCoordinator::new(
            config.stage_queue_capacity,
            transport.clone(),
            object_source,
            transaction_system,
            mode_rx.clone(),
            events_tx,
        ));

        let shared = Arc::new(EngineShared {
            transport,
            cluster_state,
            election,
            sync,
            relay,
            gc,
            data_sender,
            data_order,
            mode_rx,
            events_rx,
        });

        Ok(Engine::new(config, shared))
    }
}

//! High-availability replication engine for the Strata object server
//!
//! One node in a cluster is the writable active; every other node is a
//! passive holding a continuously updated copy of the active's object
//! graph and transaction log. This crate provides:
//! - Leader election producing exactly one active per partition
//! - Full-state synchronization (object graph + search indexes) driving a
//!   joining node from uninitialized to standby
//! - Ordered, acknowledged streaming replication of committed
//!   transactions with log trimming and backpressure
//! - Distributed garbage-collection coordination
//! - The zap policy for evicting unreachable peers
//!
//! The storage engine, search indexes, transaction system, and group
//! transport are external collaborators, injected through
//! [`EngineBuilder`].

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Builder for the engine
pub mod builder;

/// Configuration types
pub mod config;

/// Engine orchestration
mod engine;

/// Error types
pub mod error;

/// Core types, messages, and collaborator traits
pub mod foundation;

/// Engine services
pub(crate) mod services;

pub use {
    builder::EngineBuilder,
    config::{ElectionConfig, EngineConfig, RelayConfig, SyncConfig},
    engine::{Engine, EngineState},
    error::{EngineResult, Error, ErrorKind},
    foundation::traits::{
        ApplyMode, CommittedBatch, DehydratedBatch, IndexFileRef, IndexSource, ObjectSource,
        TransactionSystem,
    },
    foundation::{
        ChannelId, ClusterState, ClusterStateDelta, Enrollment, GlobalTransactionId, ObjectId,
        SequenceId, ServerMode, ServerTransactionId,
    },
};

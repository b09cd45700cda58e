//! Core types and traits shared by every engine service

pub mod cluster_state;
pub mod enrollment;
pub mod messages;
pub mod sequence;
pub mod traits;
pub mod types;
pub mod zap;

pub use cluster_state::{ClusterState, ClusterStateDelta};
pub use enrollment::Enrollment;
pub use sequence::{SequenceChecker, SequenceGenerator, SequencedSender};
pub use types::{
    ChannelId, GlobalTransactionId, ObjectId, SequenceId, ServerMode, ServerTransactionId,
};
pub use zap::Zapper;

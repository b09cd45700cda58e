//! Node identity types for the Strata cluster
//!
//! This crate provides:
//! - Node identity (`NodeId`)
//!
//! Every other crate keys its per-node state on `NodeId`, so the type lives
//! in its own crate at the bottom of the dependency graph.

pub mod node_id;

pub use node_id::NodeId;

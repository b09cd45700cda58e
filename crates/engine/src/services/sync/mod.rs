//! Full-state synchronization service

mod context;
mod service;

pub use service::StateSyncService;

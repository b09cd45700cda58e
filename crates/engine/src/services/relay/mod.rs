//! Transaction relay and acknowledgement service

mod ledger;
mod service;
mod throttle;
mod tracker;

pub use ledger::PendingAckLedger;
pub use service::RelayService;
pub use throttle::AckThrottle;
pub use tracker::GlobalTransactionTracker;

//! Node eviction ("zap") policy
//!
//! Every pipeline calls this instead of letting a group-send error escape
//! a stage. Callers reconcile their own waiting state (ledger entries,
//! sync contexts) first, then zap: the notice is broadcast so the cluster
//! knows why the member vanished, and the transport evicts the peer,
//! which surfaces as an ordinary membership departure everywhere.

use std::sync::Arc;

use strata_topology::NodeId;
use strata_transport::GroupTransport;
use tracing::{error, warn};

use super::messages::{GroupMessage, ZapNotice, ZapReason};

/// Issues zaps against unreachable or misbehaving peers
#[derive(Clone)]
pub struct Zapper {
    transport: Arc<dyn GroupTransport>,
}

impl Zapper {
    /// Create a zapper over the group transport
    pub fn new(transport: Arc<dyn GroupTransport>) -> Self {
        Self { transport }
    }

    /// Evict `target` from group membership
    pub async fn zap(&self, target: &NodeId, reason: ZapReason, cause: impl Into<String>) {
        let cause = cause.into();
        warn!("zapping {target}: {reason:?}: {cause}");

        let notice = GroupMessage::Zap(ZapNotice {
            target: target.clone(),
            reason,
            cause,
        });
        match notice.encode() {
            Ok(payload) => {
                // Best effort: the eviction below is what actually removes
                // the peer
                if let Err(e) = self.transport.broadcast(payload, notice.kind()).await {
                    warn!("zap notice broadcast failed: {e}");
                }
            }
            Err(e) => error!("failed to encode zap notice: {e}"),
        }

        if let Err(e) = self.transport.evict(target).await {
            warn!("evicting {target} failed: {e}");
        }
    }
}

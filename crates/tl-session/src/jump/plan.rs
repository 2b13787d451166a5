//! Jump chain plans

use tl_core::traits::HostTarget;
use tl_core::types::{ConnectionParams, HopSpec};
use tl_protocol::SessionId;

/// Ordered hops of one connect attempt, the target last.
///
/// A plan is consumed by the resolver; every attempt builds a fresh one.
#[derive(Debug, Clone)]
pub struct JumpChainPlan {
    session_id: SessionId,
    hops: Vec<HopSpec>,
}

impl JumpChainPlan {
    /// Build the plan for a session's connection parameters
    pub fn from_params(session_id: SessionId, params: &ConnectionParams) -> Self {
        let mut hops = params.jump_chain.clone();
        hops.push(params.target_hop());
        Self { session_id, hops }
    }

    /// Session the plan connects
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Number of hops including the target
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Check if the plan has no hops
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Whether the target is reached through at least one bastion
    pub fn is_chained(&self) -> bool {
        self.hops.len() > 1
    }

    pub(crate) fn into_hops(self) -> (SessionId, Vec<HopSpec>) {
        (self.session_id, self.hops)
    }
}

/// Connection target of one hop
pub(crate) fn host_target(hop: &HopSpec) -> HostTarget {
    HostTarget {
        host: hop.host.clone(),
        port: hop.port,
        host_key_fingerprint: hop.host_key_fingerprint.clone(),
    }
}

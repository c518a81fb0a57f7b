mod local;

use std::future::Future;
use std::time::Duration;

use ravel_storage::{Membership, SnapshotMeta};
use ravel_types::{EngineError, NodeId};

pub use local::{EngineConfig, LocalEngine};

// ---------------------------------------------------------------------------
// ConsensusEngine trait
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75).
// The explicit `+ Send` bound on each future ensures generic callers can
// `.await` across thread boundaries.
// ---------------------------------------------------------------------------

/// The narrow interface the gateway needs from a consensus engine.
///
/// Each future resolves once the engine has decided: `Ok(index)` when the
/// entry is committed and applied locally, `Err` when the engine rejected it.
/// `timeout` bounds only how long the engine may wait to *accept* the
/// operation; callers apply their own bound to the decision.
pub trait ConsensusEngine: Send + Sync + 'static {
    fn propose(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    fn add_voter(
        &self,
        id: NodeId,
        address: String,
        timeout: Duration,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    fn remove_server(
        &self,
        id: NodeId,
        timeout: Duration,
    ) -> impl Future<Output = Result<u64, EngineError>> + Send;

    /// Snapshot the state machine now and compact the log behind it.
    fn trigger_snapshot(&self) -> impl Future<Output = Result<SnapshotMeta, EngineError>> + Send;

    fn status(&self) -> EngineStatus;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower { leader: Option<String> },
    /// The state machine refused an entry; no further writes until an
    /// operator restores it.
    Halted,
    Shutdown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower { .. } => "follower",
            Role::Halted => "halted",
            Role::Shutdown => "shutdown",
        }
    }

    /// Whether this node may accept a write right now.
    pub fn check_writable(&self) -> Result<(), EngineError> {
        match self {
            Role::Leader => Ok(()),
            Role::Follower { leader } => Err(EngineError::NotLeader { leader: leader.clone() }),
            Role::Halted => Err(EngineError::Halted),
            Role::Shutdown => Err(EngineError::ShuttingDown),
        }
    }

    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            Role::Follower { leader } => leader.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub last_log_index: u64,
    pub last_snapshot_index: u64,
    pub membership: Membership,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_leader_is_writable() {
        assert!(Role::Leader.check_writable().is_ok());
        assert_eq!(
            Role::Follower { leader: Some("b:1".into()) }.check_writable(),
            Err(EngineError::NotLeader { leader: Some("b:1".into()) })
        );
        assert_eq!(Role::Halted.check_writable(), Err(EngineError::Halted));
        assert_eq!(Role::Shutdown.check_writable(), Err(EngineError::ShuttingDown));
    }

    #[test]
    fn leader_hint_only_on_followers() {
        assert_eq!(Role::Follower { leader: Some("b:1".into()) }.leader_hint(), Some("b:1"));
        assert_eq!(Role::Follower { leader: None }.leader_hint(), None);
        assert_eq!(Role::Leader.leader_hint(), None);
    }
}

use std::time::Duration;

/// Identifier of a cluster member, e.g. `"node-1"`.
pub type NodeId = String;
pub type LogIndex = u64;

/// A single state transition carried by the replicated log.
///
/// Produced by the gateway, encoded by `ravel_storage::codec`, and applied
/// exactly once per committed entry by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => key,
        }
    }
}

/// Administrative change to the voter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    AddVoter { id: NodeId, address: String },
    RemoveServer { id: NodeId },
}

/// Rejections reported by the consensus engine.
///
/// Every variant except `ApplyFailed` means the operation was *not* written
/// to the log.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<String> },
    #[error("no quorum: the voter set would be empty")]
    NoQuorum,
    #[error("consensus engine is shutting down")]
    ShuttingDown,
    #[error("timed out enqueuing operation")]
    EnqueueTimeout,
    #[error("replica halted; a snapshot restore failed and needs operator attention")]
    Halted,
    #[error("a snapshot is already in progress")]
    SnapshotInProgress,
    #[error("nothing new to snapshot")]
    NothingToSnapshot,
    #[error("log storage error: {0}")]
    Storage(String),
    /// The entry reached the log but the state machine refused it. It is
    /// replayed on the next start, so the outcome is unknown.
    #[error("entry {index} was logged but not applied; it may still be applied after recovery")]
    ApplyFailed { index: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum RavelError {
    #[error("malformed command: {0}")]
    Decode(String),
    #[error("snapshot restore failed: {0}")]
    Restore(String),
    #[error("rejected by consensus engine: {0}")]
    EngineRejected(#[from] EngineError),
    /// No decision arrived within the local bound. The command may still commit.
    #[error("no decision within {0:?}; the operation may still be applied")]
    RequestTimedOut(Duration),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RavelError {
    /// `true` when the operation is known not to have been applied.
    ///
    /// A timed-out request, or an entry logged but not applied, is
    /// ambiguous and returns `false`.
    pub fn is_definite_failure(&self) -> bool {
        !matches!(
            self,
            RavelError::RequestTimedOut(_)
                | RavelError::EngineRejected(EngineError::ApplyFailed { .. })
        )
    }
}

use std::collections::BTreeMap;

use ravel_types::{NodeId, RavelError};

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: LogPayload,
}

/// Validate a batch for `LogStorage::append` against the current last index.
///
/// The batch must be contiguous and may not start past `last + 1`. Returns
/// the first index of the batch, or `None` when it is empty.
pub(crate) fn check_append(last: Option<u64>, entries: &[LogEntry]) -> Result<Option<u64>, RavelError> {
    let Some(first) = entries.first().map(|e| e.index) else {
        return Ok(None);
    };
    for (expected, entry) in (first..).zip(entries) {
        if entry.index != expected {
            return Err(RavelError::Storage(format!(
                "non-contiguous append: expected index {expected}, found {}",
                entry.index
            )));
        }
    }
    if let Some(last) = last {
        if first > last + 1 {
            return Err(RavelError::Storage(format!(
                "append at {first} would leave a gap after {last}"
            )));
        }
    }
    Ok(Some(first))
}

/// The payload carried by a `LogEntry`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LogPayload {
    /// No-op entry.
    Blank,
    /// An encoded `Command`. Opaque to the log; only the state machine
    /// decodes it.
    Command(Vec<u8>),
    /// The complete voter set as of this entry.
    Membership(Membership),
}

/// Voter set: node id → address.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Membership {
    pub voters: BTreeMap<NodeId, String>,
}

impl Membership {
    pub fn single(id: NodeId, address: String) -> Self {
        Membership { voters: BTreeMap::from([(id, address)]) }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.voters.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }
}

/// Persisted vote, recorded when a node assumes leadership for a term.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Vote {
    pub term: u64,
    /// `None` means the node has not voted yet in this term.
    pub voted_for: Option<NodeId>,
}

/// Summary of the current log extent.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogState {
    /// Smallest index currently in the log (`None` if log is empty).
    pub first_index: Option<u64>,
    /// Largest index currently in the log (`None` if log is empty).
    pub last_index: Option<u64>,
    /// Largest index that has been purged (compacted into a snapshot).
    pub last_purged_index: Option<u64>,
}

/// Metadata identifying a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub last_log_index: u64,
    pub last_log_term: u64,
    /// UUID v4 string identifying this snapshot.
    pub snapshot_id: String,
    /// Membership in effect at `last_log_index`.
    pub membership: Membership,
}

/// A persisted state-machine snapshot.
///
/// `data` is whatever `SnapshotHandle::persist` wrote; the store treats it as
/// opaque bytes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// What `apply` did with one committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Written,
    Deleted { found: bool },
    /// The payload did not decode; the entry was skipped on every replica.
    Skipped,
    /// Blank and membership entries only advance `last_applied`.
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub index: u64,
    pub outcome: ApplyOutcome,
}

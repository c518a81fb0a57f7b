use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use ravel_types::RavelError;

use crate::types::{ApplyResult, LogEntry, LogState, Snapshot, SnapshotMeta, Vote};

/// Persistent storage for the replicated log.
///
/// Methods use RPITIT (`-> impl Future + Send`) matching the
/// `ConsensusEngine` trait style in `ravel-consensus`. This avoids any
/// `async-trait` dependency.
pub trait LogStorage: Send + Sync + 'static {
    /// Return first index, last index, and last purged index.
    fn log_state(&self) -> impl Future<Output = Result<LogState, RavelError>> + Send;

    /// Return all entries in the inclusive range `[from, to_inclusive]`.
    fn get_entries(&self, from: u64, to_inclusive: u64)
        -> impl Future<Output = Result<Vec<LogEntry>, RavelError>> + Send;

    /// Append a contiguous run of entries. An entry at an index already in
    /// the log replaces it, and every stored entry after the run is dropped.
    /// A run starting past `last_index + 1` is rejected.
    fn append(&self, entries: Vec<LogEntry>)
        -> impl Future<Output = Result<(), RavelError>> + Send;

    /// Delete all entries with `index <= up_to_index` (post-snapshot GC).
    /// Updates `last_purged_index`.
    fn purge(&self, up_to_index: u64) -> impl Future<Output = Result<(), RavelError>> + Send;

    /// Durably persist the vote.
    fn save_vote(&self, vote: Vote) -> impl Future<Output = Result<(), RavelError>> + Send;

    /// Retrieve the last persisted vote.
    fn read_vote(&self) -> impl Future<Output = Result<Option<Vote>, RavelError>> + Send;
}

/// Storage for completed snapshots.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist a snapshot and drop the ones beyond the retention limit.
    fn save(&self, snapshot: Snapshot) -> impl Future<Output = Result<(), RavelError>> + Send;

    /// The snapshot with the highest `last_log_index`, if any.
    fn latest(&self) -> impl Future<Output = Result<Option<Snapshot>, RavelError>> + Send;

    /// Metadata of every retained snapshot, newest first.
    fn list(&self) -> impl Future<Output = Result<Vec<SnapshotMeta>, RavelError>> + Send;
}

/// Callbacks the consensus engine drives.
///
/// The engine guarantees that `apply`, `snapshot` and `restore` are never
/// called concurrently with one another, and that `apply` sees committed
/// entries strictly in log order.
pub trait StateMachine: Send + Sync + 'static {
    type Snapshot: SnapshotHandle;

    /// `true` while the machine refuses entries. The engine checks this
    /// before writing anything to the log.
    fn is_halted(&self) -> bool;

    /// Apply one committed entry. Must be deterministic: every replica applying
    /// the same sequence reaches the same state.
    ///
    /// Fails only when the state machine is halted.
    fn apply(&self, entry: &LogEntry)
        -> impl Future<Output = Result<ApplyResult, RavelError>> + Send;

    /// Capture a point-in-time view. Holds the state lock only long enough to
    /// obtain the view.
    fn snapshot(&self) -> impl Future<Output = Result<Self::Snapshot, RavelError>> + Send;

    /// Replace the entire state with the content read from `source`.
    fn restore<R>(&self, source: R) -> impl Future<Output = Result<(), RavelError>> + Send
    where
        R: AsyncRead + Unpin + Send;
}

/// A frozen view produced by `StateMachine::snapshot`.
pub trait SnapshotHandle: Send + Sync + 'static {
    /// Write the complete view to `sink`. Runs outside the state lock.
    fn persist<W>(&self, sink: &mut W) -> impl Future<Output = Result<(), RavelError>> + Send
    where
        W: AsyncWrite + Unpin + Send;

    /// Signal that the view is no longer needed.
    fn release(self);
}

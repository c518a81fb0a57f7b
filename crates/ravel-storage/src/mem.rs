use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use ravel_types::RavelError;

use crate::traits::{LogStorage, SnapshotStore};
use crate::types::{check_append, LogEntry, LogState, Snapshot, SnapshotMeta, Vote};

/// Snapshots kept by `MemSnapshotStore` unless configured otherwise.
const DEFAULT_RETAIN: usize = 3;

// ---------------------------------------------------------------------------
// MemLogStorage
// ---------------------------------------------------------------------------

struct MemLogInner {
    entries: BTreeMap<u64, LogEntry>,
    last_purged: Option<u64>,
    vote: Option<Vote>,
}

/// In-memory `LogStorage` backed by a `BTreeMap`.
///
/// Intended for unit tests; not persisted across restarts.
pub struct MemLogStorage {
    inner: Arc<RwLock<MemLogInner>>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        MemLogStorage {
            inner: Arc::new(RwLock::new(MemLogInner {
                entries: BTreeMap::new(),
                last_purged: None,
                vote: None,
            })),
        }
    }
}

impl Default for MemLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemLogStorage {
    async fn log_state(&self) -> Result<LogState, RavelError> {
        let g = self.inner.read().await;
        Ok(LogState {
            first_index: g.entries.keys().next().copied(),
            last_index: g.entries.keys().next_back().copied(),
            last_purged_index: g.last_purged,
        })
    }

    async fn get_entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, RavelError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.entries.range(from..=to_inclusive).map(|(_, e)| e.clone()).collect())
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), RavelError> {
        let mut g = self.inner.write().await;
        let last = g.entries.keys().next_back().copied();
        let Some(first) = check_append(last, &entries)? else {
            return Ok(());
        };
        g.entries.retain(|&idx, _| idx < first);
        for entry in entries {
            g.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    async fn purge(&self, up_to_index: u64) -> Result<(), RavelError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx > up_to_index);
        g.last_purged = Some(up_to_index);
        Ok(())
    }

    async fn save_vote(&self, vote: Vote) -> Result<(), RavelError> {
        self.inner.write().await.vote = Some(vote);
        Ok(())
    }

    async fn read_vote(&self) -> Result<Option<Vote>, RavelError> {
        Ok(self.inner.read().await.vote.clone())
    }
}

// ---------------------------------------------------------------------------
// MemSnapshotStore
// ---------------------------------------------------------------------------

/// In-memory `SnapshotStore` keeping the newest `retain` snapshots.
///
/// Intended for unit tests; not persisted across restarts.
pub struct MemSnapshotStore {
    /// last_log_index → snapshot
    snapshots: RwLock<BTreeMap<u64, Snapshot>>,
    retain: usize,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        Self::with_retain(DEFAULT_RETAIN)
    }

    pub fn with_retain(retain: usize) -> Self {
        MemSnapshotStore { snapshots: RwLock::new(BTreeMap::new()), retain: retain.max(1) }
    }
}

impl Default for MemSnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore for MemSnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), RavelError> {
        let mut g = self.snapshots.write().await;
        g.insert(snapshot.meta.last_log_index, snapshot);
        while g.len() > self.retain {
            g.pop_first();
        }
        Ok(())
    }

    async fn latest(&self) -> Result<Option<Snapshot>, RavelError> {
        Ok(self.snapshots.read().await.values().next_back().cloned())
    }

    async fn list(&self) -> Result<Vec<SnapshotMeta>, RavelError> {
        Ok(self.snapshots.read().await.values().rev().map(|s| s.meta.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogPayload, Membership};

    // -----------------------------------------------------------------------
    // MemLogStorage tests
    // -----------------------------------------------------------------------

    fn make_entry(index: u64, term: u64) -> LogEntry {
        LogEntry { index, term, payload: LogPayload::Blank }
    }

    #[tokio::test]
    async fn log_storage_basic() {
        let store = MemLogStorage::new();

        // Empty state
        let state = store.log_state().await.unwrap();
        assert!(state.first_index.is_none());
        assert!(state.last_index.is_none());
        assert!(state.last_purged_index.is_none());

        // Append entries 1..=3
        store
            .append(vec![make_entry(1, 1), make_entry(2, 1), make_entry(3, 1)])
            .await
            .unwrap();

        let state = store.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(3));

        // Get range
        let entries = store.get_entries(1, 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].index, 2);
        assert!(store.get_entries(3, 2).await.unwrap().is_empty());

        // Purge up to index 1
        store.purge(1).await.unwrap();
        let state = store.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(2));
        assert_eq!(state.last_purged_index, Some(1));
    }

    #[tokio::test]
    async fn overlapping_append_replaces_tail() {
        let store = MemLogStorage::new();
        store
            .append((1..=4).map(|i| make_entry(i, 1)).collect())
            .await
            .unwrap();

        store.append(vec![make_entry(2, 2)]).await.unwrap();
        let state = store.log_state().await.unwrap();
        assert_eq!(state.last_index, Some(2));
        assert_eq!(store.get_entries(2, 2).await.unwrap()[0].term, 2);

        assert!(store.append(vec![make_entry(4, 2)]).await.is_err());
        assert!(store.append(vec![make_entry(3, 2), make_entry(5, 2)]).await.is_err());
        assert_eq!(store.log_state().await.unwrap().last_index, Some(2));
    }

    #[tokio::test]
    async fn log_storage_vote() {
        let store = MemLogStorage::new();

        assert!(store.read_vote().await.unwrap().is_none());

        let vote = Vote { term: 5, voted_for: Some("n3".into()) };
        store.save_vote(vote.clone()).await.unwrap();

        let loaded = store.read_vote().await.unwrap().unwrap();
        assert_eq!(loaded, vote);
    }

    // -----------------------------------------------------------------------
    // MemSnapshotStore tests
    // -----------------------------------------------------------------------

    fn make_snapshot(index: u64) -> Snapshot {
        Snapshot {
            meta: SnapshotMeta {
                last_log_index: index,
                last_log_term: 1,
                snapshot_id: format!("snap-{index}"),
                membership: Membership::single("n1".into(), "a:1".into()),
            },
            data: vec![index as u8],
        }
    }

    #[tokio::test]
    async fn snapshot_store_retains_newest() {
        let store = MemSnapshotStore::with_retain(2);
        assert!(store.latest().await.unwrap().is_none());

        for i in [3, 1, 7, 5] {
            store.save(make_snapshot(i)).await.unwrap();
        }

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.meta.last_log_index, 7);
        assert_eq!(latest.data, vec![7]);

        let ids: Vec<u64> = store.list().await.unwrap().iter().map(|m| m.last_log_index).collect();
        assert_eq!(ids, vec![7, 5]);
    }
}

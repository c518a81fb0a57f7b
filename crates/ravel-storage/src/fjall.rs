use std::path::Path;
use std::sync::Arc;

use ravel_types::RavelError;

use crate::keys::{meta_key, raft_log_index, raft_log_key, META_LAST_PURGED, META_VOTE};
use crate::traits::LogStorage;
use crate::types::{check_append, LogEntry, LogState, Vote};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, RavelError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| RavelError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, RavelError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| RavelError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> RavelError {
    RavelError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> RavelError {
    RavelError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping both keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// Both keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic.
pub struct FjallStore {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// Log entries: `index(8)` → bincode(LogEntry)
    pub raft_log: fjall::Keyspace,
    /// Miscellaneous metadata: `label_utf8` → bincode(value)
    pub meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, RavelError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let raft_log =
            db.keyspace("raft_log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, raft_log, meta }))
    }
}

enum Edge {
    First,
    Last,
}

impl FjallStore {
    /// Smallest or largest index in the log keyspace.
    fn edge_index(&self, edge: Edge) -> Result<Option<u64>, RavelError> {
        let mut iter = self.raft_log.range(raft_log_key(0).to_vec()..=raft_log_key(u64::MAX).to_vec());
        let guard = match edge {
            Edge::First => iter.next(),
            Edge::Last => iter.next_back(),
        };
        let Some(guard) = guard else {
            return Ok(None);
        };
        let (k, _) = guard.into_inner().map_err(fjall_err)?;
        raft_log_index(&k)
            .map(Some)
            .ok_or_else(|| RavelError::Storage("short raft_log key".into()))
    }
}

// ---------------------------------------------------------------------------
// FjallLogStorage
// ---------------------------------------------------------------------------

/// `LogStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallLogStorage(pub Arc<FjallStore>);

impl LogStorage for FjallLogStorage {
    async fn log_state(&self) -> Result<LogState, RavelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<LogState, RavelError> {
            let first_index = store.edge_index(Edge::First)?;
            let last_index = store.edge_index(Edge::Last)?;
            let last_purged_index =
                match store.meta.get(meta_key(META_LAST_PURGED)).map_err(fjall_err)? {
                    Some(b) => Some(decode::<u64>(&b)?),
                    None => None,
                };

            Ok(LogState { first_index, last_index, last_purged_index })
        })
        .await
        .map_err(join_err)?
    }

    async fn get_entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, RavelError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>, RavelError> {
            let start = raft_log_key(from).to_vec();
            let end = raft_log_key(to_inclusive).to_vec();
            store
                .raft_log
                .range(start..=end)
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<LogEntry>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), RavelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RavelError> {
            let last = store.edge_index(Edge::Last)?;
            let Some(first) = check_append(last, &entries)? else {
                return Ok(());
            };

            let mut batch = store.db.batch();
            // Entries past the new run belong to the replaced tail.
            let run_end = first + entries.len() as u64;
            if last.is_some_and(|last| last >= run_end) {
                for guard in store.raft_log.range(raft_log_key(run_end).to_vec()..) {
                    let (k, _) = guard.into_inner().map_err(fjall_err)?;
                    batch.remove(&store.raft_log, k.to_vec());
                }
            }
            for entry in &entries {
                batch.insert(&store.raft_log, raft_log_key(entry.index).to_vec(), encode(entry)?);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn purge(&self, up_to_index: u64) -> Result<(), RavelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RavelError> {
            let start = raft_log_key(0).to_vec();
            let end = raft_log_key(up_to_index).to_vec();

            let keys: Vec<Vec<u8>> = store
                .raft_log
                .range(start..=end)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.raft_log, k);
            }
            batch.insert(&store.meta, meta_key(META_LAST_PURGED), encode(&up_to_index)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn save_vote(&self, vote: Vote) -> Result<(), RavelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RavelError> {
            store.meta.insert(meta_key(META_VOTE), encode(&vote)?).map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn read_vote(&self) -> Result<Option<Vote>, RavelError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Vote>, RavelError> {
            match store.meta.get(meta_key(META_VOTE)).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<Vote>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogPayload, Membership};

    fn make_entry(index: u64, term: u64) -> LogEntry {
        LogEntry { index, term, payload: LogPayload::Command(vec![1, index as u8]) }
    }

    fn open_store(dir: &std::path::Path) -> Arc<FjallStore> {
        FjallStore::open(dir).expect("open store")
    }

    #[tokio::test]
    async fn log_storage_basic() {
        let dir = tempfile::tempdir().unwrap();
        let log = FjallLogStorage(open_store(dir.path()));

        let state = log.log_state().await.unwrap();
        assert!(state.first_index.is_none());
        assert!(state.last_purged_index.is_none());

        log.append(vec![make_entry(1, 1), make_entry(2, 1), make_entry(3, 1)])
            .await
            .unwrap();

        let state = log.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(3));

        let es = log.get_entries(1, 2).await.unwrap();
        assert_eq!(es, vec![make_entry(1, 1), make_entry(2, 1)]);

        log.purge(1).await.unwrap();
        let state = log.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(2));
        assert_eq!(state.last_purged_index, Some(1));
        assert!(log.get_entries(1, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overwrite_drops_conflicting_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = FjallLogStorage(open_store(dir.path()));
        log.append((1..=5).map(|i| make_entry(i, 1)).collect()).await.unwrap();

        log.append(vec![make_entry(3, 2), make_entry(4, 2)]).await.unwrap();
        let state = log.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(4));
        let terms: Vec<u64> = log.get_entries(1, 10).await.unwrap().iter().map(|e| e.term).collect();
        assert_eq!(terms, vec![1, 1, 2, 2]);

        assert!(log.append(vec![make_entry(9, 2)]).await.is_err());
        assert_eq!(log.log_state().await.unwrap().last_index, Some(4));
    }

    #[tokio::test]
    async fn log_storage_vote() {
        let dir = tempfile::tempdir().unwrap();
        let log = FjallLogStorage(open_store(dir.path()));

        assert!(log.read_vote().await.unwrap().is_none());

        let vote = Vote { term: 7, voted_for: Some("n1".into()) };
        log.save_vote(vote.clone()).await.unwrap();

        let loaded = log.read_vote().await.unwrap().unwrap();
        assert_eq!(loaded, vote);
    }

    #[tokio::test]
    async fn log_durability() {
        let dir = tempfile::tempdir().unwrap();
        let membership = LogEntry {
            index: 2,
            term: 1,
            payload: LogPayload::Membership(Membership::single("n1".into(), "a:1".into())),
        };
        {
            let log = FjallLogStorage(open_store(dir.path()));
            log.append(vec![make_entry(1, 1), membership.clone()]).await.unwrap();
            log.save_vote(Vote { term: 1, voted_for: Some("n1".into()) }).await.unwrap();
        }
        // Reopen at the same path.
        let log = FjallLogStorage(open_store(dir.path()));
        let state = log.log_state().await.unwrap();
        assert_eq!(state.last_index, Some(2));
        assert_eq!(log.get_entries(2, 2).await.unwrap(), vec![membership]);
        assert_eq!(log.read_vote().await.unwrap().unwrap().term, 1);
    }
}

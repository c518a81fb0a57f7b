use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;

use ravel_types::{Command, RavelError};

use crate::codec;
use crate::traits::{SnapshotHandle, StateMachine};
use crate::types::{ApplyOutcome, ApplyResult, LogEntry, LogPayload};

/// Snapshot body format version.
const SNAPSHOT_FORMAT: u32 = 1;

type KvMap = HashMap<String, String>;

struct FsmInner {
    /// Copy-on-write: a live `KvSnapshot` shares this map, and the next
    /// mutation clones it.
    data: Arc<KvMap>,
    last_applied: Option<u64>,
}

/// The replicated key-value state machine.
///
/// Reads take the shared lock and may be stale on a follower. `apply`,
/// `restore` and the capture step of `snapshot` are serialised by the engine.
pub struct KvStateMachine {
    inner: RwLock<FsmInner>,
    halted: AtomicBool,
    skipped: AtomicU64,
}

impl KvStateMachine {
    pub fn new() -> Self {
        KvStateMachine {
            inner: RwLock::new(FsmInner { data: Arc::new(HashMap::new()), last_applied: None }),
            halted: AtomicBool::new(false),
            skipped: AtomicU64::new(0),
        }
    }

    /// Local read of the last applied value.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.read().await.data.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.data.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn last_applied(&self) -> Option<u64> {
        self.inner.read().await.last_applied
    }

    /// Number of committed entries skipped because they did not decode.
    pub fn skipped_entries(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Default for KvStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(serde::Serialize)]
struct SnapshotBodyRef<'a> {
    format: u32,
    last_applied: Option<u64>,
    entries: &'a KvMap,
}

#[derive(serde::Deserialize)]
struct SnapshotBody {
    format: u32,
    last_applied: Option<u64>,
    entries: KvMap,
}

impl StateMachine for KvStateMachine {
    type Snapshot = KvSnapshot;

    /// `true` after a failed restore until a restore succeeds.
    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    async fn apply(&self, entry: &LogEntry) -> Result<ApplyResult, RavelError> {
        if self.is_halted() {
            return Err(RavelError::Restore(format!(
                "state machine halted; refusing to apply index {}",
                entry.index
            )));
        }

        // Decode before taking the lock.
        let decoded = match &entry.payload {
            LogPayload::Command(bytes) => Some(codec::decode(bytes)),
            LogPayload::Blank | LogPayload::Membership(_) => None,
        };

        let mut g = self.inner.write().await;
        let outcome = match decoded {
            None => ApplyOutcome::Noop,
            Some(Err(err)) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(index = entry.index, error = %err, "skipping undecodable log entry");
                ApplyOutcome::Skipped
            }
            Some(Ok(Command::Set { key, value })) => {
                Arc::make_mut(&mut g.data).insert(key, value);
                ApplyOutcome::Written
            }
            Some(Ok(Command::Delete { key })) => {
                let found = g.data.contains_key(&key);
                if found {
                    Arc::make_mut(&mut g.data).remove(&key);
                }
                ApplyOutcome::Deleted { found }
            }
        };
        g.last_applied = Some(entry.index);
        Ok(ApplyResult { index: entry.index, outcome })
    }

    async fn snapshot(&self) -> Result<KvSnapshot, RavelError> {
        if self.is_halted() {
            return Err(RavelError::Restore("state machine halted; refusing to snapshot".into()));
        }
        // Applies clone the map before mutating it while a view shares it, so
        // the shared lock is enough to capture a consistent view.
        let g = self.inner.read().await;
        Ok(KvSnapshot { data: g.data.clone(), last_applied: g.last_applied })
    }

    async fn restore<R>(&self, mut source: R) -> Result<(), RavelError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        let parsed = match source.read_to_end(&mut buf).await {
            Ok(_) => serde_json::from_slice::<SnapshotBody>(&buf).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let body = match parsed {
            Ok(body) if body.format == SNAPSHOT_FORMAT => body,
            Ok(body) => {
                return Err(self.halt(format!("unsupported snapshot format {}", body.format)))
            }
            Err(e) => return Err(self.halt(e)),
        };

        let mut g = self.inner.write().await;
        g.data = Arc::new(body.entries);
        g.last_applied = body.last_applied;
        self.halted.store(false, Ordering::Release);
        tracing::info!(keys = g.data.len(), last_applied = ?g.last_applied, "state machine restored");
        Ok(())
    }
}

impl KvStateMachine {
    fn halt(&self, reason: String) -> RavelError {
        self.halted.store(true, Ordering::Release);
        tracing::error!(%reason, "snapshot restore failed; halting state machine");
        RavelError::Restore(reason)
    }
}

/// Point-in-time view of the map, shared with the state machine until released.
pub struct KvSnapshot {
    data: Arc<KvMap>,
    last_applied: Option<u64>,
}

impl SnapshotHandle for KvSnapshot {
    async fn persist<W>(&self, sink: &mut W) -> Result<(), RavelError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let body = SnapshotBodyRef {
            format: SNAPSHOT_FORMAT,
            last_applied: self.last_applied,
            entries: self.data.as_ref(),
        };
        let bytes = serde_json::to_vec(&body).map_err(|e| RavelError::Storage(e.to_string()))?;
        sink.write_all(&bytes).await.map_err(|e| RavelError::Storage(e.to_string()))?;
        sink.flush().await.map_err(|e| RavelError::Storage(e.to_string()))
    }

    fn release(self) {
        tracing::debug!(last_applied = ?self.last_applied, "snapshot view released");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn entry(index: u64, cmd: Command) -> LogEntry {
        LogEntry { index, term: 1, payload: LogPayload::Command(codec::encode(&cmd).unwrap()) }
    }

    fn set(key: &str, value: &str) -> Command {
        Command::Set { key: key.into(), value: value.into() }
    }

    fn del(key: &str) -> Command {
        Command::Delete { key: key.into() }
    }

    async fn apply_all(sm: &KvStateMachine, cmds: Vec<Command>) {
        for (i, cmd) in cmds.into_iter().enumerate() {
            sm.apply(&entry(i as u64 + 1, cmd)).await.unwrap();
        }
    }

    async fn persisted(sm: &KvStateMachine) -> Vec<u8> {
        let snap = sm.snapshot().await.unwrap();
        let mut buf = Vec::new();
        snap.persist(&mut buf).await.unwrap();
        snap.release();
        buf
    }

    #[tokio::test]
    async fn overwrite_then_get() {
        let sm = KvStateMachine::new();
        apply_all(&sm, vec![set("a", "1"), set("a", "2")]).await;
        assert_eq!(sm.get("a").await.as_deref(), Some("2"));
        assert_eq!(sm.get("b").await, None);
        assert_eq!(sm.last_applied().await, Some(2));
    }

    #[tokio::test]
    async fn set_then_delete() {
        let sm = KvStateMachine::new();
        apply_all(&sm, vec![set("x", "v")]).await;
        let res = sm.apply(&entry(2, del("x"))).await.unwrap();
        assert_eq!(res, ApplyResult { index: 2, outcome: ApplyOutcome::Deleted { found: true } });
        assert_eq!(sm.get("x").await, None);
    }

    #[tokio::test]
    async fn delete_absent_is_noop() {
        let sm = KvStateMachine::new();
        apply_all(&sm, vec![set("keep", "1")]).await;
        let res = sm.apply(&entry(2, del("missing"))).await.unwrap();
        assert_eq!(res.outcome, ApplyOutcome::Deleted { found: false });
        assert_eq!(sm.len().await, 1);
        assert_eq!(sm.skipped_entries(), 0);
    }

    #[tokio::test]
    async fn apply_matches_direct_map_mutation() {
        let sm = KvStateMachine::new();
        let mut model: HashMap<String, String> = HashMap::new();
        let mut cmds = Vec::new();
        for i in 0..2_000u32 {
            let key = format!("k{}", rand::random::<u8>() % 32);
            if rand::random::<u8>() % 3 == 0 {
                model.remove(&key);
                cmds.push(del(&key));
            } else {
                let value = format!("v{i}");
                model.insert(key.clone(), value.clone());
                cmds.push(set(&key, &value));
            }
        }
        apply_all(&sm, cmds).await;

        assert_eq!(sm.len().await, model.len());
        for i in 0..32 {
            let key = format!("k{i}");
            assert_eq!(sm.get(&key).await, model.get(&key).cloned(), "key {key}");
        }
    }

    #[tokio::test]
    async fn corrupt_entry_is_skipped_and_counted() {
        let sm = KvStateMachine::new();
        apply_all(&sm, vec![set("a", "1")]).await;

        let corrupt = LogEntry { index: 2, term: 1, payload: LogPayload::Command(vec![1, 0, 200]) };
        let res = sm.apply(&corrupt).await.unwrap();
        assert_eq!(res.outcome, ApplyOutcome::Skipped);
        assert_eq!(sm.skipped_entries(), 1);
        assert_eq!(sm.get("a").await.as_deref(), Some("1"));
        assert_eq!(sm.len().await, 1);
        // The index still advances so the next entry applies in order.
        assert_eq!(sm.last_applied().await, Some(2));
    }

    #[tokio::test]
    async fn non_command_entries_only_advance_index() {
        let sm = KvStateMachine::new();
        let blank = LogEntry { index: 7, term: 2, payload: LogPayload::Blank };
        assert_eq!(sm.apply(&blank).await.unwrap().outcome, ApplyOutcome::Noop);
        assert!(sm.is_empty().await);
        assert_eq!(sm.last_applied().await, Some(7));
    }

    #[tokio::test]
    async fn snapshot_restore_into_fresh_machine() {
        let sm = KvStateMachine::new();
        apply_all(&sm, vec![set("k", "v")]).await;
        let bytes = persisted(&sm).await;

        let fresh = KvStateMachine::new();
        fresh.restore(&bytes[..]).await.unwrap();
        assert_eq!(fresh.get("k").await.as_deref(), Some("v"));
        assert_eq!(fresh.last_applied().await, Some(1));
    }

    #[tokio::test]
    async fn restore_replaces_all_content() {
        let source = KvStateMachine::new();
        apply_all(&source, vec![set("a", "1"), set("b", "2"), del("a"), set("c", "3")]).await;
        let bytes = persisted(&source).await;

        let target = KvStateMachine::new();
        apply_all(&target, vec![set("stale", "x"), set("a", "old")]).await;
        target.restore(&bytes[..]).await.unwrap();

        assert_eq!(target.len().await, 2);
        assert_eq!(target.get("a").await, None);
        assert_eq!(target.get("stale").await, None);
        assert_eq!(target.get("b").await.as_deref(), Some("2"));
        assert_eq!(target.get("c").await.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn snapshot_is_frozen_while_applies_continue() {
        let sm = KvStateMachine::new();
        apply_all(&sm, vec![set("a", "1")]).await;

        let snap = sm.snapshot().await.unwrap();
        sm.apply(&entry(2, set("a", "2"))).await.unwrap();
        sm.apply(&entry(3, set("b", "3"))).await.unwrap();

        let mut buf = Vec::new();
        snap.persist(&mut buf).await.unwrap();
        snap.release();

        let restored = KvStateMachine::new();
        restored.restore(&buf[..]).await.unwrap();
        assert_eq!(restored.get("a").await.as_deref(), Some("1"));
        assert_eq!(restored.get("b").await, None);
        assert_eq!(sm.get("a").await.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn malformed_restore_halts() {
        let sm = KvStateMachine::new();
        apply_all(&sm, vec![set("a", "1")]).await;

        let err = sm.restore(&b"{\"format\":1,\"entr"[..]).await.unwrap_err();
        assert!(matches!(err, RavelError::Restore(_)));
        assert!(sm.is_halted());
        assert!(sm.apply(&entry(2, set("b", "2"))).await.is_err());
        assert!(sm.snapshot().await.is_err());
        // Nothing was partially replaced.
        assert_eq!(sm.get("a").await.as_deref(), Some("1"));

        // A successful restore clears the halt.
        let good = persisted(&KvStateMachine::new()).await;
        sm.restore(&good[..]).await.unwrap();
        assert!(!sm.is_halted());
        sm.apply(&entry(3, set("b", "2"))).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_snapshot_format_halts() {
        let sm = KvStateMachine::new();
        let body = br#"{"format":99,"last_applied":null,"entries":{}}"#;
        assert!(sm.restore(&body[..]).await.is_err());
        assert!(sm.is_halted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_see_consistent_state_during_snapshot() {
        const WRITES: u64 = 2_000;
        let sm = Arc::new(KvStateMachine::new());
        let done = Arc::new(AtomicBool::new(false));

        // Entry `i` sets k = i, so every committed value is an index.
        let writer = {
            let sm = sm.clone();
            tokio::spawn(async move {
                for i in 1..=WRITES {
                    sm.apply(&entry(i, set("k", &i.to_string()))).await.unwrap();
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let (sm, done) = (sm.clone(), done.clone());
            readers.push(tokio::spawn(async move {
                let mut seen = 0u64;
                let mut reads = 0u64;
                while !done.load(Ordering::Acquire) {
                    if let Some(v) = sm.get("k").await {
                        let v: u64 = v.parse().expect("only committed values are visible");
                        assert!((1..=WRITES).contains(&v));
                        assert!(v >= seen, "went backwards from {seen} to {v}");
                        seen = v;
                    }
                    reads += 1;
                    tokio::task::yield_now().await;
                }
                reads
            }));
        }

        while sm.last_applied().await.unwrap_or(0) < WRITES / 4 {
            tokio::task::yield_now().await;
        }
        let snap = sm.snapshot().await.unwrap();
        let captured = snap.last_applied.unwrap();
        let mut buf = Vec::new();
        snap.persist(&mut buf).await.unwrap();
        snap.release();

        writer.await.unwrap();
        done.store(true, Ordering::Release);
        for r in readers {
            assert!(r.await.unwrap() > 0);
        }

        let restored = KvStateMachine::new();
        restored.restore(&buf[..]).await.unwrap();
        assert_eq!(restored.last_applied().await, Some(captured));
        assert_eq!(restored.len().await, 1);
        assert_eq!(restored.get("k").await, Some(captured.to_string()));
        assert_eq!(sm.get("k").await, Some(WRITES.to_string()));
    }

    #[tokio::test]
    async fn restore_of_snapshot_reproduces_random_state() {
        let sm = KvStateMachine::new();
        let mut cmds = Vec::new();
        for i in 0..1_000u32 {
            let key = format!("k{}", rand::random::<u8>() % 64);
            if rand::random::<u8>() % 4 == 0 {
                cmds.push(del(&key));
            } else {
                cmds.push(set(&key, &format!("v{i}-{}", rand::random::<u32>())));
            }
        }
        apply_all(&sm, cmds).await;
        let bytes = persisted(&sm).await;

        let restored = KvStateMachine::new();
        apply_all(&restored, vec![set("leftover", "x")]).await;
        restored.restore(&bytes[..]).await.unwrap();

        assert_eq!(*restored.inner.read().await.data, *sm.inner.read().await.data);
        assert_eq!(restored.last_applied().await, sm.last_applied().await);
    }
}

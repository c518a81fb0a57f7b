use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use ravel_storage::{
    LogEntry, LogPayload, LogStorage, Membership, Snapshot, SnapshotHandle, SnapshotMeta,
    SnapshotStore, StateMachine, Vote,
};
use ravel_types::{EngineError, MembershipChange, NodeId, RavelError};

use crate::{ConsensusEngine, EngineStatus, Role};

/// Default depth of the proposal queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_id: NodeId,
    /// Address recorded for this node in the membership.
    pub address: String,
    /// Commit a single-voter membership for this node if none exists yet.
    pub bootstrap: bool,
    pub apply_queue_capacity: usize,
    /// Snapshot automatically after this many applied entries. `0` disables.
    pub snapshot_threshold: u64,
    /// Entries kept in the log behind the newest snapshot.
    pub trailing_logs: u64,
}

impl EngineConfig {
    pub fn new(node_id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        EngineConfig {
            node_id: node_id.into(),
            address: address.into(),
            bootstrap: false,
            apply_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            snapshot_threshold: 8192,
            trailing_logs: 10_240,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Request {
    Propose { payload: Vec<u8>, reply: Reply<u64> },
    Membership { change: MembershipChange, reply: Reply<u64> },
    Snapshot { reply: Reply<SnapshotMeta> },
    Shutdown,
}

impl Request {
    fn reject(self, err: EngineError) {
        match self {
            Request::Propose { reply, .. } | Request::Membership { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(Err(err));
            }
            Request::Shutdown => {}
        }
    }
}

// ---------------------------------------------------------------------------
// LocalEngine: in-process, single-replica engine
// ---------------------------------------------------------------------------

/// In-process consensus engine for a single replica.
///
/// A driver task is the only writer: it numbers entries, appends them to
/// `LogStorage`, applies them through the `StateMachine` in index order and
/// answers the proposer. There is no replication; a voter set with more than
/// one member is recorded but every commit is local.
pub struct LocalEngine {
    tx: mpsc::Sender<Request>,
    status: Arc<watch::Sender<EngineStatus>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl LocalEngine {
    /// Recover from `snapshots` and `log`, then start the driver task.
    ///
    /// Fails with `RavelError::Restore` if the newest snapshot is malformed;
    /// the state machine is left halted in that case.
    pub async fn start<S, L, P>(
        config: EngineConfig,
        fsm: Arc<S>,
        log: Arc<L>,
        snapshots: Arc<P>,
    ) -> Result<Self, RavelError>
    where
        S: StateMachine,
        L: LogStorage,
        P: SnapshotStore,
    {
        let mut membership = Membership::default();
        let mut last_index = 0;
        let mut term = 0;
        let mut snapshot_index = 0;

        if let Some(snap) = snapshots.latest().await? {
            fsm.restore(&snap.data[..]).await?;
            membership = snap.meta.membership.clone();
            last_index = snap.meta.last_log_index;
            snapshot_index = snap.meta.last_log_index;
            term = snap.meta.last_log_term;
            tracing::info!(
                snapshot_id = %snap.meta.snapshot_id,
                last_log_index = last_index,
                "restored snapshot"
            );
        }

        let state = log.log_state().await?;
        if let Some(last) = state.last_index.filter(|&last| last > last_index) {
            let entries = log.get_entries(last_index + 1, last).await?;
            for entry in entries {
                if entry.index != last_index + 1 {
                    return Err(RavelError::Storage(format!(
                        "log gap: expected index {}, found {}",
                        last_index + 1,
                        entry.index
                    )));
                }
                if let LogPayload::Membership(m) = &entry.payload {
                    membership = m.clone();
                }
                fsm.apply(&entry).await?;
                last_index = entry.index;
                term = term.max(entry.term);
            }
            tracing::info!(replayed_to = last_index, "replayed log");
        }

        if let Some(vote) = log.read_vote().await? {
            term = term.max(vote.term);
        }

        let voter = membership.contains(&config.node_id);
        let bootstrapping = membership.is_empty() && config.bootstrap;
        if config.bootstrap && !membership.is_empty() {
            tracing::info!("existing membership found; ignoring bootstrap");
        }

        let role = if voter || bootstrapping {
            term += 1;
            log.save_vote(Vote { term, voted_for: Some(config.node_id.clone()) }).await?;
            Role::Leader
        } else {
            Role::Follower { leader: None }
        };

        let (status, _) = watch::channel(EngineStatus {
            node_id: config.node_id.clone(),
            role,
            term,
            last_log_index: last_index,
            last_snapshot_index: snapshot_index,
            membership: membership.clone(),
        });
        let status = Arc::new(status);

        let (tx, rx) = mpsc::channel(config.apply_queue_capacity.max(1));
        let mut driver = Driver {
            config,
            fsm,
            log,
            snapshots,
            term,
            last_index,
            membership,
            applied_since_snapshot: last_index - snapshot_index,
            snapshot_in_flight: Arc::new(AtomicBool::new(false)),
            status: status.clone(),
        };

        if bootstrapping {
            let initial = Membership::single(driver.config.node_id.clone(), driver.config.address.clone());
            let index = driver.commit_membership(initial).await?;
            tracing::info!(index, node_id = %driver.config.node_id, "bootstrapped cluster");
        }

        {
            let s = status.borrow();
            tracing::info!(
                node_id = %s.node_id,
                role = s.role.as_str(),
                term = s.term,
                last_log_index = s.last_log_index,
                "consensus engine started"
            );
        }

        let handle = tokio::spawn(driver.run(rx));
        Ok(LocalEngine { tx, status, driver: Mutex::new(Some(handle)) })
    }

    /// Give up leadership; writes are rejected with `NotLeader { leader }`.
    pub fn step_down(&self, leader: Option<String>) {
        self.status.send_modify(|s| {
            if s.role == Role::Leader {
                tracing::info!(?leader, "stepping down");
                s.role = Role::Follower { leader };
            }
        });
    }

    /// Reject queued and future operations and stop the driver task.
    pub async fn shutdown(&self) {
        self.status.send_modify(|s| s.role = Role::Shutdown);
        let _ = self.tx.send(Request::Shutdown).await;
        if let Some(handle) = self.driver.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    fn check_writable(&self) -> Result<(), EngineError> {
        let role = self.status.borrow().role.clone();
        role.check_writable()
    }

    async fn enqueue(&self, req: Request, timeout: Duration) -> Result<(), EngineError> {
        if timeout.is_zero() {
            return self.tx.send(req).await.map_err(|_| EngineError::ShuttingDown);
        }
        match self.tx.send_timeout(req, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(EngineError::EnqueueTimeout),
            Err(SendTimeoutError::Closed(_)) => Err(EngineError::ShuttingDown),
        }
    }

    async fn submit_membership(
        &self,
        change: MembershipChange,
        timeout: Duration,
    ) -> Result<u64, EngineError> {
        self.check_writable()?;
        let (reply, rx) = oneshot::channel();
        self.enqueue(Request::Membership { change, reply }, timeout).await?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }
}

impl ConsensusEngine for LocalEngine {
    async fn propose(&self, payload: Vec<u8>, timeout: Duration) -> Result<u64, EngineError> {
        self.check_writable()?;
        let (reply, rx) = oneshot::channel();
        self.enqueue(Request::Propose { payload, reply }, timeout).await?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    async fn add_voter(
        &self,
        id: NodeId,
        address: String,
        timeout: Duration,
    ) -> Result<u64, EngineError> {
        self.submit_membership(MembershipChange::AddVoter { id, address }, timeout).await
    }

    async fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<u64, EngineError> {
        self.submit_membership(MembershipChange::RemoveServer { id }, timeout).await
    }

    async fn trigger_snapshot(&self) -> Result<SnapshotMeta, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Snapshot { reply })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }
}

// ---------------------------------------------------------------------------
// Driver: the single writer
// ---------------------------------------------------------------------------

struct Driver<S, L, P> {
    config: EngineConfig,
    fsm: Arc<S>,
    log: Arc<L>,
    snapshots: Arc<P>,
    term: u64,
    last_index: u64,
    membership: Membership,
    applied_since_snapshot: u64,
    snapshot_in_flight: Arc<AtomicBool>,
    status: Arc<watch::Sender<EngineStatus>>,
}

impl<S, L, P> Driver<S, L, P>
where
    S: StateMachine,
    L: LogStorage,
    P: SnapshotStore,
{
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(req) = rx.recv().await {
            match req {
                Request::Propose { payload, reply } => {
                    let _ = reply.send(self.propose(payload).await);
                }
                Request::Membership { change, reply } => {
                    let _ = reply.send(self.change_membership(change).await);
                }
                Request::Snapshot { reply } => self.start_snapshot(Some(reply)).await,
                Request::Shutdown => break,
            }
            self.maybe_compact().await;
        }

        rx.close();
        while let Ok(req) = rx.try_recv() {
            req.reject(EngineError::ShuttingDown);
        }
        tracing::info!(last_log_index = self.last_index, "consensus engine stopped");
    }

    fn role(&self) -> Role {
        self.status.borrow().role.clone()
    }

    /// Nothing reaches the log unless the state machine can apply it.
    fn check_accepting(&self) -> Result<(), EngineError> {
        self.role().check_writable()?;
        if self.fsm.is_halted() {
            self.halt();
            return Err(EngineError::Halted);
        }
        Ok(())
    }

    fn halt(&self) {
        self.status.send_if_modified(|s| match s.role {
            Role::Halted | Role::Shutdown => false,
            _ => {
                tracing::error!("state machine halted; refusing writes");
                s.role = Role::Halted;
                true
            }
        });
    }

    async fn propose(&mut self, payload: Vec<u8>) -> Result<u64, EngineError> {
        self.check_accepting()?;
        let entry = self.append(LogPayload::Command(payload)).await?;
        self.apply(&entry).await
    }

    async fn change_membership(&mut self, change: MembershipChange) -> Result<u64, EngineError> {
        self.check_accepting()?;
        let mut next = self.membership.clone();
        match &change {
            MembershipChange::AddVoter { id, address } => {
                next.voters.insert(id.clone(), address.clone());
            }
            MembershipChange::RemoveServer { id } => {
                next.voters.remove(id);
                if next.is_empty() {
                    return Err(EngineError::NoQuorum);
                }
            }
        }

        let index = self.commit_membership(next).await?;
        tracing::info!(?change, index, "membership changed");

        if !self.membership.contains(&self.config.node_id) {
            tracing::warn!("removed from the voter set; stepping down");
            self.status.send_modify(|s| s.role = Role::Follower { leader: None });
        }
        Ok(index)
    }

    async fn commit_membership(&mut self, next: Membership) -> Result<u64, EngineError> {
        let entry = self.append(LogPayload::Membership(next.clone())).await?;
        let index = self.apply(&entry).await?;
        self.membership = next;
        let membership = self.membership.clone();
        self.status.send_modify(|s| s.membership = membership);
        Ok(index)
    }

    async fn append(&mut self, payload: LogPayload) -> Result<LogEntry, EngineError> {
        let entry = LogEntry { index: self.last_index + 1, term: self.term, payload };
        self.log
            .append(vec![entry.clone()])
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        self.last_index = entry.index;
        let (last_index, term) = (self.last_index, self.term);
        self.status.send_modify(|s| {
            s.last_log_index = last_index;
            s.term = term;
        });
        Ok(entry)
    }

    async fn apply(&mut self, entry: &LogEntry) -> Result<u64, EngineError> {
        match self.fsm.apply(entry).await {
            Ok(result) => {
                self.applied_since_snapshot += 1;
                Ok(result.index)
            }
            Err(e) => {
                tracing::error!(index = entry.index, error = %e, "state machine refused logged entry");
                self.halt();
                Err(EngineError::ApplyFailed { index: entry.index })
            }
        }
    }

    async fn maybe_compact(&mut self) {
        let threshold = self.config.snapshot_threshold;
        if threshold > 0
            && self.applied_since_snapshot >= threshold
            && !self.snapshot_in_flight.load(Ordering::Acquire)
        {
            tracing::debug!(applied = self.applied_since_snapshot, "snapshot threshold reached");
            self.start_snapshot(None).await;
        }
    }

    fn check_snapshottable(&self) -> Result<(), EngineError> {
        match self.role() {
            Role::Halted => return Err(EngineError::Halted),
            Role::Shutdown => return Err(EngineError::ShuttingDown),
            Role::Leader | Role::Follower { .. } => {}
        }
        if self.snapshot_in_flight.load(Ordering::Acquire) {
            return Err(EngineError::SnapshotInProgress);
        }
        if self.last_index == self.status.borrow().last_snapshot_index {
            return Err(EngineError::NothingToSnapshot);
        }
        Ok(())
    }

    /// Capture the state machine view here, between applies, and persist it
    /// on a separate task so the driver keeps applying.
    async fn start_snapshot(&mut self, reply: Option<Reply<SnapshotMeta>>) {
        let respond = |reply: Option<Reply<SnapshotMeta>>, res: Result<SnapshotMeta, EngineError>| {
            if let Some(reply) = reply {
                let _ = reply.send(res);
            }
        };

        if let Err(e) = self.check_snapshottable() {
            respond(reply, Err(e));
            return;
        }

        let handle = match self.fsm.snapshot().await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "state machine refused to snapshot");
                self.halt();
                respond(reply, Err(EngineError::Halted));
                return;
            }
        };
        self.snapshot_in_flight.store(true, Ordering::Release);
        self.applied_since_snapshot = 0;

        let meta = SnapshotMeta {
            last_log_index: self.last_index,
            last_log_term: self.term,
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            membership: self.membership.clone(),
        };
        let job = SnapshotJob {
            log: self.log.clone(),
            snapshots: self.snapshots.clone(),
            status: self.status.clone(),
            trailing_logs: self.config.trailing_logs,
        };
        let in_flight = self.snapshot_in_flight.clone();

        tokio::spawn(async move {
            let res = job.run(handle, meta).await;
            in_flight.store(false, Ordering::Release);
            if let Err(e) = &res {
                tracing::error!(error = %e, "snapshot failed");
            }
            respond(reply, res);
        });
    }
}

struct SnapshotJob<L, P> {
    log: Arc<L>,
    snapshots: Arc<P>,
    status: Arc<watch::Sender<EngineStatus>>,
    trailing_logs: u64,
}

impl<L: LogStorage, P: SnapshotStore> SnapshotJob<L, P> {
    async fn run<H: SnapshotHandle>(
        self,
        handle: H,
        meta: SnapshotMeta,
    ) -> Result<SnapshotMeta, EngineError> {
        let storage = |e: RavelError| EngineError::Storage(e.to_string());

        let mut data = Vec::new();
        let persisted = handle.persist(&mut data).await;
        handle.release();
        persisted.map_err(storage)?;

        self.snapshots
            .save(Snapshot { meta: meta.clone(), data })
            .await
            .map_err(storage)?;

        let compact_to = meta.last_log_index.saturating_sub(self.trailing_logs);
        if compact_to > 0 {
            self.log.purge(compact_to).await.map_err(storage)?;
        }
        self.status.send_modify(|s| s.last_snapshot_index = meta.last_log_index);
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = meta.last_log_index,
            compacted_to = compact_to,
            "snapshot complete"
        );
        Ok(meta)
    }
}

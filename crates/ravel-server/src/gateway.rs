use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ravel_consensus::ConsensusEngine;
use ravel_storage::{codec, KvStateMachine, SnapshotMeta};
use ravel_types::{Command, EngineError, NodeId, RavelError};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bound on waiting for a write decision.
    pub write_timeout: Duration,
    /// Bound on membership changes, which may wait for a new member to catch up.
    pub membership_timeout: Duration,
    pub snapshot_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            write_timeout: Duration::from_secs(1),
            membership_timeout: Duration::from_secs(30),
            snapshot_timeout: Duration::from_secs(60),
        }
    }
}

/// What a pending request asked the engine to do. Values are not logged.
#[derive(Debug)]
enum Directive<'a> {
    Write(&'a Command),
    AddVoter { id: &'a str, address: &'a str },
    RemoveServer { id: &'a str },
    Snapshot,
}

impl fmt::Display for Directive<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Write(cmd) => {
                let verb = match cmd {
                    Command::Set { .. } => "set",
                    Command::Delete { .. } => "delete",
                };
                write!(f, "{verb} {:?}", cmd.key())
            }
            Directive::AddVoter { id, address } => write!(f, "add voter {id} at {address}"),
            Directive::RemoveServer { id } => write!(f, "remove server {id}"),
            Directive::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// One in-flight request: `Submitted -> Committed | Rejected | TimedOut`.
struct PendingOp<'a> {
    directive: Directive<'a>,
    submitted_at: Instant,
    bound: Duration,
}

impl<'a> PendingOp<'a> {
    fn submit(directive: Directive<'a>, bound: Duration) -> Self {
        tracing::debug!(op = %directive, ?bound, "submitting to consensus engine");
        PendingOp { directive, submitted_at: Instant::now(), bound }
    }

    fn elapsed_ms(&self) -> u128 {
        self.submitted_at.elapsed().as_millis()
    }

    fn committed(self) {
        tracing::debug!(op = %self.directive, elapsed_ms = self.elapsed_ms(), "committed");
    }

    fn rejected(self, err: &EngineError) {
        tracing::warn!(op = %self.directive, elapsed_ms = self.elapsed_ms(), error = %err, "rejected by engine");
    }

    fn timed_out(self) {
        tracing::warn!(
            op = %self.directive,
            bound_ms = self.bound.as_millis(),
            "no decision within bound; outcome unknown"
        );
    }
}

/// Turns client operations into local reads or submit-and-wait cycles
/// against the consensus engine.
///
/// Reads never touch consensus. Writes and administrative operations wait at
/// most their configured bound; a request that runs out of time is reported
/// as `RequestTimedOut` and is *not* retried: the engine may still commit it.
pub struct Gateway<E> {
    fsm: Arc<KvStateMachine>,
    engine: Arc<E>,
    config: GatewayConfig,
}

impl<E: ConsensusEngine> Gateway<E> {
    pub fn new(fsm: Arc<KvStateMachine>, engine: Arc<E>, config: GatewayConfig) -> Self {
        Gateway { fsm, engine, config }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn state_machine(&self) -> &Arc<KvStateMachine> {
        &self.fsm
    }

    /// Local, stale-tolerant read.
    pub async fn handle_get(&self, key: &str) -> Result<Option<String>, RavelError> {
        require("key", key)?;
        Ok(self.fsm.get(key).await)
    }

    pub async fn handle_set(&self, key: String, value: String) -> Result<u64, RavelError> {
        self.write(Command::Set { key, value }).await
    }

    pub async fn handle_delete(&self, key: String) -> Result<u64, RavelError> {
        self.write(Command::Delete { key }).await
    }

    pub async fn handle_add_voter(&self, id: NodeId, address: String) -> Result<u64, RavelError> {
        require("node id", &id)?;
        require("address", &address)?;
        let bound = self.config.membership_timeout;
        let pending = PendingOp::submit(Directive::AddVoter { id: &id, address: &address }, bound);
        let decision = self.engine.add_voter(id.clone(), address.clone(), enqueue_bound(bound));
        await_decision(pending, decision).await
    }

    pub async fn handle_remove_server(&self, id: NodeId) -> Result<u64, RavelError> {
        require("node id", &id)?;
        let bound = self.config.membership_timeout;
        let pending = PendingOp::submit(Directive::RemoveServer { id: &id }, bound);
        let decision = self.engine.remove_server(id.clone(), enqueue_bound(bound));
        await_decision(pending, decision).await
    }

    /// Ask the engine to snapshot now. The engine calls the state machine
    /// itself; the gateway never touches it here.
    pub async fn handle_snapshot_trigger(&self) -> Result<SnapshotMeta, RavelError> {
        let pending = PendingOp::submit(Directive::Snapshot, self.config.snapshot_timeout);
        await_decision(pending, self.engine.trigger_snapshot()).await
    }

    async fn write(&self, cmd: Command) -> Result<u64, RavelError> {
        require("key", cmd.key())?;
        let payload = codec::encode(&cmd)?;
        let bound = self.config.write_timeout;
        let pending = PendingOp::submit(Directive::Write(&cmd), bound);
        await_decision(pending, self.engine.propose(payload, enqueue_bound(bound))).await
    }
}

/// The engine gets half the bound to accept an operation, so a full queue
/// surfaces as a definite `EnqueueTimeout` rather than racing the local bound.
fn enqueue_bound(bound: Duration) -> Duration {
    bound / 2
}

fn require(what: &str, value: &str) -> Result<(), RavelError> {
    if value.is_empty() {
        return Err(RavelError::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(())
}

async fn await_decision<T, F>(pending: PendingOp<'_>, decision: F) -> Result<T, RavelError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(pending.bound, decision).await {
        Ok(Ok(value)) => {
            pending.committed();
            Ok(value)
        }
        Ok(Err(err)) => {
            pending.rejected(&err);
            Err(RavelError::EngineRejected(err))
        }
        Err(_) => {
            let bound = pending.bound;
            pending.timed_out();
            Err(RavelError::RequestTimedOut(bound))
        }
    }
}

pub mod codec;
pub mod fjall;
pub mod fsm;
pub mod keys;
pub mod mem;
pub mod snapshot;
pub mod traits;
pub mod types;

pub use fsm::{KvSnapshot, KvStateMachine};
pub use traits::{LogStorage, SnapshotHandle, SnapshotStore, StateMachine};
pub use types::{
    ApplyOutcome, ApplyResult, LogEntry, LogPayload, LogState, Membership, Snapshot, SnapshotMeta,
    Vote,
};

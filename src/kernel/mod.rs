//! Kernel module: deterministic execution on top of the replicated log.
//!
//! The kernel sits on top of the storage engine and provides:
//! - The state machine contract and handler registry
//! - Client sessions (exactly-once commands)
//! - In-order execution with poison-pill handling
//! - Snapshot creation and persistence

pub mod executor;
pub mod kv;
pub mod session;
pub mod snapshot;
pub mod traits;

pub use executor::{Applied, ApplyOutcome, Executor, ExecutorError, ExecutorSnapshot, ExecutorStatus};
pub use kv::KvStore;
pub use session::{ClientId, Registration, SessionError, SessionId, SessionManager, SessionState};
pub use snapshot::{SnapshotError, SnapshotFile, SNAPSHOT_FILE_NAME};
pub use traits::{
    decode_output, BlockTime, CommandOp, Commit, HandlerRegistry, Operation, OperationCategory,
    OperationError, OperationResult, QueryOp, StateMachine,
};

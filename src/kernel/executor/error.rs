//! Executor error types and apply outcomes.

use thiserror::Error;

use crate::engine::{LogIndex, NodeId, Term};
use crate::kernel::session::{ClientId, SessionError, SessionId};
use crate::kernel::snapshot::SnapshotError;
use crate::kernel::traits::OperationResult;

// =============================================================================
// EXECUTOR STATUS
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorStatus {
    Running,
    /// A handler panicked. No further entries are applied.
    Halted,
}

// =============================================================================
// APPLY OUTCOME
// =============================================================================

/// What applying one entry produced, for whoever waits on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    NoOp,
    /// A command ran, or its earlier result was replayed.
    Command {
        session_id: SessionId,
        sequence: u64,
        result: OperationResult,
        duplicate: bool,
    },
    /// The command's session is not open. Nothing ran.
    CommandRejected {
        session_id: SessionId,
        sequence: u64,
        error: SessionError,
    },
    QueryMarker,
    Configuration {
        members: Vec<NodeId>,
    },
    Registered {
        session_id: SessionId,
        client_id: ClientId,
        superseded: Option<SessionId>,
    },
    KeptAlive {
        session_id: SessionId,
        result: Result<(), SessionError>,
    },
    Closed {
        session_id: SessionId,
        result: Result<(), SessionError>,
    },
    Expired {
        session_id: SessionId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub index: LogIndex,
    pub term: Term,
    pub applied: Applied,
}

// =============================================================================
// FATAL ERROR
// =============================================================================

/// Errors that stop the executor from making progress.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A handler panicked while applying `index`.
    #[error("poison pill at index {index}: {message}")]
    PoisonPill { index: LogIndex, message: String },

    /// The executor halted earlier and refuses further work.
    #[error("executor is halted")]
    Halted,

    /// Entries must be applied at exactly `last_applied + 1`.
    #[error("out-of-order apply: expected index {expected}, got {found}")]
    OutOfOrder { expected: LogIndex, found: LogIndex },

    /// A system entry (registration, configuration) could not be decoded.
    /// User command payloads never produce this; they become operation errors.
    #[error("malformed {kind} entry at index {index}: {reason}")]
    MalformedEntry {
        index: LogIndex,
        kind: &'static str,
        reason: String,
    },

    #[error("state machine restore failed: {0}")]
    Restore(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

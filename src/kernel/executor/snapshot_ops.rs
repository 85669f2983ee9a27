use serde::{Deserialize, Serialize};

use crate::engine::{LogIndex, NodeId, Term};
use crate::kernel::session::SessionManager;
use crate::kernel::snapshot::{SnapshotError, SnapshotFile};
use crate::kernel::traits::{BlockTime, StateMachine};

use super::error::{ExecutorError, ExecutorStatus};
use super::Executor;

/// Everything needed to resume applying at `last_applied + 1`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    pub last_applied: LogIndex,
    pub last_applied_term: Term,
    pub last_time: BlockTime,
    pub members: Vec<NodeId>,
    pub sessions: SessionManager,
    /// Opaque user state from `StateMachine::snapshot`.
    pub machine: Vec<u8>,
}

impl<S: StateMachine> Executor<S> {
    /// Capture the applied state: user state, sessions and members.
    ///
    /// The image represents APPLIED state, so it is always at or below the
    /// commit index and may be used to compact the log through
    /// `last_applied`.
    pub fn snapshot(&self) -> Result<SnapshotFile, ExecutorError> {
        if self.status == ExecutorStatus::Halted {
            return Err(ExecutorError::Halted);
        }
        let image = ExecutorSnapshot {
            last_applied: self.last_applied,
            last_applied_term: self.last_applied_term,
            last_time: self.last_time,
            members: self.members.clone(),
            sessions: self.sessions.clone(),
            machine: self.machine.snapshot(),
        };
        let state = bincode::serialize(&image).map_err(|e| SnapshotError::Encoding(e.to_string()))?;
        Ok(SnapshotFile::new(self.last_applied, self.last_applied_term, state))
    }

    /// Replace all executor state with a snapshot image.
    ///
    /// A malformed or mismatched image leaves the executor unchanged.
    pub fn restore(&mut self, file: &SnapshotFile) -> Result<(), ExecutorError> {
        let image: ExecutorSnapshot =
            bincode::deserialize(&file.state).map_err(|e| SnapshotError::Encoding(e.to_string()))?;
        if image.last_applied != file.last_included_index || image.last_applied_term != file.last_included_term {
            return Err(ExecutorError::Restore(format!(
                "header says ({}, {}) but image holds ({}, {})",
                file.last_included_index, file.last_included_term, image.last_applied, image.last_applied_term
            )));
        }
        self.machine
            .restore(&image.machine)
            .map_err(|e| ExecutorError::Restore(e.to_string()))?;

        self.last_applied = image.last_applied;
        self.last_applied_term = image.last_applied_term;
        self.last_time = image.last_time;
        self.members = image.members;
        self.sessions = image.sessions;
        self.status = ExecutorStatus::Running;
        tracing::info!(
            last_applied = self.last_applied,
            term = self.last_applied_term,
            sessions = self.sessions.len(),
            "executor restored from snapshot"
        );
        Ok(())
    }
}

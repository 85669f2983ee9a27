mod error;
mod snapshot_ops;
mod step;

#[cfg(test)]
mod tests;

use std::panic::{self, AssertUnwindSafe};

use crate::engine::{LogIndex, NodeId, Term};
use crate::kernel::session::{SessionId, SessionManager};
use crate::kernel::traits::{
    BlockTime, Commit, HandlerRegistry, Operation, OperationError, OperationResult, StateMachine,
};

pub use error::{Applied, ApplyOutcome, ExecutorError, ExecutorStatus};
pub use snapshot_ops::ExecutorSnapshot;

/// The state machine executor.
///
/// Owns:
/// - One user state machine and its handler table
/// - The session table
/// - The applied member set
/// - One execution cursor (`last_applied`)
/// - One terminal status: Running | Halted
///
/// The consensus layer decides what is committed; the executor only sees
/// entries handed to [`Executor::apply`], one at a time, in index order.
pub struct Executor<S: StateMachine> {
    pub(crate) machine: S,
    pub(crate) registry: HandlerRegistry<S>,
    pub(crate) sessions: SessionManager,
    pub(crate) members: Vec<NodeId>,
    pub(crate) last_applied: LogIndex,
    pub(crate) last_applied_term: Term,
    /// Latest log time seen. Never moves backwards.
    pub(crate) last_time: BlockTime,
    pub(crate) status: ExecutorStatus,
}

impl<S: StateMachine> Executor<S> {
    /// Create an executor for a fresh log with the bootstrap member set.
    pub fn new(machine: S, members: Vec<NodeId>) -> Self {
        let mut registry = HandlerRegistry::new();
        S::configure(&mut registry);
        Executor {
            machine,
            registry,
            sessions: SessionManager::new(),
            members,
            last_applied: 0,
            last_applied_term: 0,
            last_time: BlockTime(0),
            status: ExecutorStatus::Running,
        }
    }

    pub fn machine(&self) -> &S {
        &self.machine
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn last_applied_term(&self) -> Term {
        self.last_applied_term
    }

    pub fn last_time(&self) -> BlockTime {
        self.last_time
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status
    }

    pub fn is_halted(&self) -> bool {
        self.status == ExecutorStatus::Halted
    }

    /// Run a query against the current state.
    ///
    /// The caller decides whether the state is fresh enough; this only
    /// dispatches. A panicking query handler is reported as an application
    /// error since it cannot have changed state.
    pub fn query(&self, session_id: SessionId, sequence: u64, operation: &Operation) -> OperationResult {
        let commit = Commit {
            index: self.last_applied,
            session_id,
            sequence,
            time: self.last_time,
            operation,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| self.registry.apply_query(&self.machine, commit))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(name = %operation.name, %message, "query handler panicked");
                Err(OperationError::Application(format!("query '{}' panicked: {}", operation.name, message)))
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "<unknown panic>".to_string()
    }
}

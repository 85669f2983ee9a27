use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::{LogError, ManifestError, NodeId};
use crate::kernel::executor::ExecutorError;
use crate::kernel::session::{SessionError, SessionId};
use crate::kernel::snapshot::SnapshotError;
use crate::kernel::traits::OperationError;

/// Errors a client can observe for one request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ClientError {
    #[error("not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("session {0} expired")]
    SessionExpired(SessionId),

    #[error("session {0} is unknown")]
    SessionUnknown(SessionId),

    #[error("session {0} was closed")]
    SessionClosed(SessionId),

    #[error("request timed out")]
    Timeout,

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// The requested consistency could not be reached in time. No result
    /// was produced, so nothing stale was returned.
    #[error("consistency condition not met before the deadline")]
    ConsistencyTimeout,

    #[error(transparent)]
    Operation(OperationError),
}

impl ClientError {
    /// Whether trying again (possibly elsewhere) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::NotLeader { .. }
                | ClientError::Timeout
                | ClientError::Unavailable(_)
                | ClientError::ConsistencyTimeout
        )
    }

    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            ClientError::SessionExpired(_) | ClientError::SessionUnknown(_) | ClientError::SessionClosed(_)
        )
    }
}

impl From<SessionError> for ClientError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Unknown(id) => ClientError::SessionUnknown(id),
            SessionError::Expired(id) => ClientError::SessionExpired(id),
            SessionError::Closed(id) => ClientError::SessionClosed(id),
        }
    }
}

impl From<OperationError> for ClientError {
    fn from(error: OperationError) -> Self {
        ClientError::Operation(error)
    }
}

/// Node construction and storage failures.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("node {0} is not in the member set")]
    NotMember(NodeId),

    #[error("not the leader")]
    NotLeader,

    #[error("a configuration change is already in progress")]
    ConfigurationPending,
}

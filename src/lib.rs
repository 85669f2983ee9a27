//! raftsm: a Raft replicated state machine.
//!
//! - `engine`: the durable log and the term/vote manifest
//! - `kernel`: the state machine executor and client sessions
//! - `raft`: consensus, consistency routing, the client and the node runner
//! - `chaos`: a deterministic cluster simulator with fault injection

pub mod chaos;
pub mod config;
pub mod engine;
pub mod kernel;
pub mod raft;
pub mod telemetry;

pub use config::{ClientConfig, ConfigError, NodeConfig, ReadMode};
pub use engine::{DurableLog, EntryKind, LogEntry, LogIndex, NodeId, Term};
pub use kernel::{CommandOp, Executor, KvStore, Operation, OperationError, QueryOp, StateMachine};
pub use raft::{
    ClientError, ClusterClient, CommandConsistency, MockNetwork, NodeRole, NodeStatus, OperationId,
    QueryConsistency, RaftError, RaftNode, ServerHandle, SessionStatus,
};

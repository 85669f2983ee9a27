//! Log entry model shared by the durable log, replication and the executor.

use serde::{Deserialize, Serialize};

/// Position of an entry in the replicated log. The first entry has index 1.
pub type LogIndex = u64;

/// Raft term. Term 0 precedes every election.
pub type Term = u64;

/// Cluster member identifier.
pub type NodeId = u32;

/// What an entry means to the executor.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Appended by every new leader in its own term. Only advances `last_applied`.
    NoOp = 0,
    /// User command, dispatched to the registered command handler.
    Command = 1,
    /// Sequences a linearizable read through the log without mutating state.
    QueryMarker = 2,
    /// Replaces the member set. Payload is a bincode `Vec<NodeId>`.
    Configuration = 3,
    /// Opens a client session. The session id is this entry's index.
    Register = 4,
    /// Refreshes a session and acknowledges results up to `sequence`.
    KeepAlive = 5,
    /// Explicit client close.
    Unregister = 6,
    /// Leader-decided expiration of an idle session.
    Expire = 7,
}

impl EntryKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EntryKind::NoOp),
            1 => Some(EntryKind::Command),
            2 => Some(EntryKind::QueryMarker),
            3 => Some(EntryKind::Configuration),
            4 => Some(EntryKind::Register),
            5 => Some(EntryKind::KeepAlive),
            6 => Some(EntryKind::Unregister),
            7 => Some(EntryKind::Expire),
            _ => None,
        }
    }

    /// Session lifecycle entries carry no user operation.
    pub fn is_session_entry(self) -> bool {
        matches!(
            self,
            EntryKind::Register | EntryKind::KeepAlive | EntryKind::Unregister | EntryKind::Expire
        )
    }
}

/// A single replicated log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    /// Owning session, 0 when the entry has none.
    pub session_id: u64,
    /// Client sequence number for commands, acknowledged sequence for keep-alives.
    pub sequence: u64,
    /// Consensus timestamp assigned by the leader, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

/// Header fields of an entry that has not been assigned an index yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEntry {
    pub term: Term,
    pub kind: EntryKind,
    pub session_id: u64,
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

impl NewEntry {
    pub fn no_op(term: Term, timestamp_ns: u64) -> Self {
        NewEntry {
            term,
            kind: EntryKind::NoOp,
            session_id: 0,
            sequence: 0,
            timestamp_ns,
            payload: Vec::new(),
        }
    }

    pub fn with_index(self, index: LogIndex) -> LogEntry {
        LogEntry {
            index,
            term: self.term,
            kind: self.kind,
            session_id: self.session_id,
            sequence: self.sequence,
            timestamp_ns: self.timestamp_ns,
            payload: self.payload,
        }
    }
}

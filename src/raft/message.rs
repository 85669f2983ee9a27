use serde::{Deserialize, Serialize};

use crate::engine::{LogEntry, LogIndex, NodeId, Term};
use crate::kernel::session::{ClientId, SessionId};
use crate::kernel::traits::Operation;

use super::error::ClientError;

/// Correlates a client request with its response. Unique per client.
pub type RequestId = u64;

/// Anything that can receive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Address {
    Node(NodeId),
    Client(ClientId),
}

/// Consensus protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },

    RequestVoteResponse {
        term: Term,
        vote_granted: bool,
    },

    /// Log replication, and heartbeat when `entries` is empty.
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
        /// Heartbeat round this message belongs to. Echoed in the response
        /// so the leader can confirm leadership for reads and leases.
        round: u64,
    },

    AppendEntriesResponse {
        term: Term,
        success: bool,
        /// Highest index known to match the leader's log.
        match_index: LogIndex,
        /// Where the leader should resume on a mismatch.
        conflict_index: LogIndex,
        round: u64,
    },

    /// Replaces a lagging follower's state with the leader's snapshot.
    InstallSnapshot {
        term: Term,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        /// Encoded snapshot file (header and executor image).
        data: Vec<u8>,
        round: u64,
    },

    InstallSnapshotResponse {
        term: Term,
        success: bool,
        last_included_index: LogIndex,
        round: u64,
    },
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term, .. } => *term,
        }
    }
}

// =============================================================================
// CONSISTENCY LEVELS
// =============================================================================

/// When a command is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandConsistency {
    /// Fire-and-forget: no cross-session ordering is promised. Answered
    /// once applied at the leader.
    None,
    /// After commit and apply at the leader.
    Sequential,
    Linearizable,
}

/// Where a query is served and what it must observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryConsistency {
    /// Any node, at or after the client's own writes.
    Causal,
    /// Any node, at or after the commit index the node knew on arrival.
    Sequential,
    /// The leader, locally under a lease.
    BoundedLinearizable,
    /// The leader, after confirming it still leads.
    Linearizable,
}

impl QueryConsistency {
    pub fn leader_only(self) -> bool {
        matches!(self, QueryConsistency::BoundedLinearizable | QueryConsistency::Linearizable)
    }
}

// =============================================================================
// CLIENT PROTOCOL
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Register {
        client_id: ClientId,
        timeout_ms: u64,
    },
    KeepAlive {
        session_id: SessionId,
        ack_sequence: u64,
    },
    Command {
        session_id: SessionId,
        sequence: u64,
        operation: Operation,
        consistency: CommandConsistency,
    },
    Query {
        session_id: SessionId,
        /// Last command sequence submitted before this query.
        sequence: u64,
        /// Highest log index the client has observed.
        index: LogIndex,
        operation: Operation,
        consistency: QueryConsistency,
    },
    Close {
        session_id: SessionId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub request_id: RequestId,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    Registered {
        session_id: SessionId,
        /// Session timeout after clamping.
        timeout_ms: u64,
        members: Vec<NodeId>,
        leader: Option<NodeId>,
    },
    KeptAlive {
        members: Vec<NodeId>,
        leader: Option<NodeId>,
    },
    /// Encoded handler output and the index it was applied or read at.
    Output {
        index: LogIndex,
        output: Vec<u8>,
    },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub request_id: RequestId,
    pub result: Result<ClientReply, ClientError>,
}

// =============================================================================
// ENVELOPE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Raft(RaftMessage),
    Request(ClientRequest),
    Response(ClientResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Address,
    pub to: Address,
    pub message: Message,
}

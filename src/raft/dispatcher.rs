//! Consistency-level routing.
//!
//! Pure decisions over a snapshot of node state. The node builds a
//! [`ReadContext`], asks where a request should go, and carries out the
//! answer.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::ReadMode;
use crate::engine::{LogIndex, NodeId};

use super::message::{CommandConsistency, QueryConsistency};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// What the dispatcher needs to know about the node.
#[derive(Debug, Clone, Copy)]
pub struct ReadContext {
    pub role: NodeRole,
    pub leader_hint: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    /// Index of the leader's first entry in its term. Reads must not be
    /// served from before it commits.
    pub term_start_index: LogIndex,
    /// End of the current lease, if any.
    pub lease_until: Option<Instant>,
    pub read_mode: ReadMode,
    pub now: Instant,
}

impl ReadContext {
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    /// The leader has committed an entry of its own term.
    pub fn leader_ready(&self) -> bool {
        self.is_leader() && self.commit_index >= self.term_start_index
    }

    pub fn lease_valid(&self) -> bool {
        self.leader_ready() && self.lease_until.is_some_and(|until| self.now < until)
    }

    fn redirect_hint(&self) -> Option<NodeId> {
        self.leader_hint
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRoute {
    Redirect { leader_hint: Option<NodeId> },
    /// Append, then acknowledge once applied.
    AckOnApply,
}

pub fn route_command(ctx: &ReadContext, consistency: CommandConsistency) -> CommandRoute {
    if !ctx.is_leader() {
        return CommandRoute::Redirect {
            leader_hint: ctx.redirect_hint(),
        };
    }
    // Every level goes through the log; they differ in client-side ordering only.
    match consistency {
        CommandConsistency::None | CommandConsistency::Sequential | CommandConsistency::Linearizable => {
            CommandRoute::AckOnApply
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRoute {
    Redirect { leader_hint: Option<NodeId> },
    /// Serve locally once `last_applied >= index`.
    WaitApplied { index: LogIndex },
    /// Confirm leadership with a heartbeat round, then serve at `read_index`.
    ReadIndex { read_index: LogIndex },
    /// Append a query marker and serve when it applies.
    LogMarker,
}

/// Decide how to serve a query that carries the client's observed index.
pub fn route_query(ctx: &ReadContext, consistency: QueryConsistency, client_index: LogIndex) -> QueryRoute {
    match consistency {
        QueryConsistency::Causal => QueryRoute::WaitApplied { index: client_index },
        QueryConsistency::Sequential => QueryRoute::WaitApplied {
            index: client_index.max(ctx.commit_index),
        },
        QueryConsistency::BoundedLinearizable => {
            if !ctx.is_leader() {
                return QueryRoute::Redirect {
                    leader_hint: ctx.redirect_hint(),
                };
            }
            if ctx.lease_valid() {
                QueryRoute::WaitApplied {
                    index: client_index.max(ctx.commit_index),
                }
            } else {
                linearizable(ctx, client_index)
            }
        }
        QueryConsistency::Linearizable => {
            if !ctx.is_leader() {
                return QueryRoute::Redirect {
                    leader_hint: ctx.redirect_hint(),
                };
            }
            linearizable(ctx, client_index)
        }
    }
}

fn linearizable(ctx: &ReadContext, client_index: LogIndex) -> QueryRoute {
    match ctx.read_mode {
        ReadMode::LogMarker => QueryRoute::LogMarker,
        ReadMode::ReadIndex => QueryRoute::ReadIndex {
            read_index: ctx.commit_index.max(ctx.term_start_index).max(client_index),
        },
    }
}

/// What the leader should do with a command's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceRoute {
    /// Already applied; answer from the session cache.
    Cached,
    /// Already appended at `index` and not applied yet; wait for it.
    Attach { index: LogIndex },
    /// Next in line; append it.
    Append,
    /// A predecessor is missing; hold it.
    Hold,
}

/// `applied` is the session's highest applied sequence, `appended` the
/// highest sequence in the unapplied log tail (if higher), and `in_tail`
/// the index of this exact sequence if it is in that tail.
pub fn route_sequence(applied: u64, appended: u64, in_tail: Option<LogIndex>, sequence: u64) -> SequenceRoute {
    if sequence <= applied {
        return SequenceRoute::Cached;
    }
    if let Some(index) = in_tail {
        return SequenceRoute::Attach { index };
    }
    let last = applied.max(appended);
    if sequence == last + 1 {
        SequenceRoute::Append
    } else if sequence > last + 1 {
        SequenceRoute::Hold
    } else {
        // Between applied and appended but not found: its entry was lost
        // with an earlier leader's uncommitted tail. Appending again keeps
        // the session moving.
        SequenceRoute::Append
    }
}

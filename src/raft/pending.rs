//! Requests waiting for a log position or a consistency condition.
//!
//! Everything here is plain bookkeeping owned by one node; the node decides
//! when a condition holds and posts the response.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::engine::{LogIndex, Term};
use crate::kernel::session::SessionId;
use crate::kernel::traits::Operation;

use super::error::ClientError;
use super::message::{Address, RequestId};

/// Who to answer, and until when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter {
    pub client: Address,
    pub request_id: RequestId,
    pub deadline: Instant,
}

/// A request answered when the entry at its index is applied.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub waiter: Waiter,
    /// Term the entry was appended in. A different term at apply time means
    /// the entry was replaced.
    pub term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCondition {
    /// Serve once `last_applied >= index`.
    Applied { index: LogIndex },
    /// Serve once a majority acknowledged `round` of `term` and
    /// `last_applied >= read_index`.
    ReadIndex {
        read_index: LogIndex,
        round: u64,
        term: Term,
    },
    /// Serve once the query marker at `index` with `term` is applied.
    Marker { index: LogIndex, term: Term },
}

#[derive(Debug, Clone)]
pub struct PendingRead {
    pub waiter: Waiter,
    pub session_id: SessionId,
    /// The session must have applied this command sequence first.
    pub sequence: u64,
    pub operation: Operation,
    pub condition: ReadCondition,
    /// Fails with `NotLeader` if this node loses leadership before serving.
    pub leader_only: bool,
}

/// A command that arrived ahead of its predecessors.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub waiter: Waiter,
    pub operation: Operation,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    writes: BTreeMap<LogIndex, Vec<PendingWrite>>,
    reads: Vec<PendingRead>,
    queued: BTreeMap<SessionId, BTreeMap<u64, QueuedCommand>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_write(&mut self, index: LogIndex, write: PendingWrite) {
        self.writes.entry(index).or_default().push(write);
    }

    /// Waiters for `index`, removed from the table.
    pub fn take_writes(&mut self, index: LogIndex) -> Vec<PendingWrite> {
        self.writes.remove(&index).unwrap_or_default()
    }

    pub fn add_read(&mut self, read: PendingRead) {
        self.reads.push(read);
    }

    /// Remove and return every read for which `ready` holds.
    pub fn take_reads<F>(&mut self, mut ready: F) -> Vec<PendingRead>
    where
        F: FnMut(&PendingRead) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.reads.len());
        for read in self.reads.drain(..) {
            if ready(&read) {
                taken.push(read);
            } else {
                kept.push(read);
            }
        }
        self.reads = kept;
        taken
    }

    /// Replaces an earlier queued copy of the same sequence (a retry).
    pub fn queue_command(&mut self, session_id: SessionId, sequence: u64, command: QueuedCommand) {
        self.queued.entry(session_id).or_default().insert(sequence, command);
    }

    pub fn take_queued(&mut self, session_id: SessionId, sequence: u64) -> Option<QueuedCommand> {
        let queue = self.queued.get_mut(&session_id)?;
        let command = queue.remove(&sequence);
        if queue.is_empty() {
            self.queued.remove(&session_id);
        }
        command
    }

    /// Drop every queued command of a session that no longer exists.
    pub fn drop_session(&mut self, session_id: SessionId) -> Vec<Waiter> {
        self.queued
            .remove(&session_id)
            .map(|q| q.into_values().map(|c| c.waiter).collect())
            .unwrap_or_default()
    }

    /// Remove everything past its deadline, paired with the error to send.
    pub fn expire(&mut self, now: Instant) -> Vec<(Waiter, ClientError)> {
        let mut expired = Vec::new();

        for writes in self.writes.values_mut() {
            writes.retain(|w| {
                if w.waiter.deadline <= now {
                    expired.push((w.waiter.clone(), ClientError::Timeout));
                    false
                } else {
                    true
                }
            });
        }
        self.writes.retain(|_, writes| !writes.is_empty());

        for read in self.take_reads(|r| r.waiter.deadline <= now) {
            expired.push((read.waiter, ClientError::ConsistencyTimeout));
        }

        for queue in self.queued.values_mut() {
            queue.retain(|_, c| {
                if c.waiter.deadline <= now {
                    expired.push((c.waiter.clone(), ClientError::Timeout));
                    false
                } else {
                    true
                }
            });
        }
        self.queued.retain(|_, q| !q.is_empty());

        expired
    }

    /// Remove everything that only a leader can complete.
    pub fn drain_leader_only(&mut self) -> Vec<Waiter> {
        let mut drained: Vec<Waiter> = std::mem::take(&mut self.writes)
            .into_values()
            .flatten()
            .map(|w| w.waiter)
            .collect();
        drained.extend(
            std::mem::take(&mut self.queued)
                .into_values()
                .flat_map(|q| q.into_values())
                .map(|c| c.waiter),
        );
        drained.extend(self.take_reads(|r| r.leader_only).into_iter().map(|r| r.waiter));
        drained
    }

    /// Remove everything.
    pub fn drain_all(&mut self) -> Vec<Waiter> {
        let mut drained = self.drain_leader_only();
        drained.extend(self.reads.drain(..).map(|r| r.waiter));
        drained
    }

    pub fn write_count(&self) -> usize {
        self.writes.values().map(Vec::len).sum()
    }

    pub fn read_count(&self) -> usize {
        self.reads.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.reads.is_empty() && self.queued.is_empty()
    }
}

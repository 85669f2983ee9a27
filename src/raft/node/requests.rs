//! Client requests: session lifecycle, command sequencing and reads.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::engine::{EntryKind, LogIndex, NewEntry, NodeId};
use crate::kernel::session::{Registration, SequenceCheck, SessionId};
use crate::kernel::traits::{Operation, OperationError, StateMachine};
use crate::raft::dispatcher::{route_command, route_query, route_sequence, CommandRoute, QueryRoute, SequenceRoute};
use crate::raft::error::{ClientError, RaftError};
use crate::raft::message::{
    Address, ClientReply, ClientRequest, CommandConsistency, QueryConsistency, RequestKind,
};
use crate::raft::pending::{PendingRead, PendingWrite, QueuedCommand, ReadCondition, Waiter};

use super::{NodeRole, RaftNode};

fn entry(kind: EntryKind, session_id: SessionId, sequence: u64, payload: Vec<u8>) -> NewEntry {
    NewEntry {
        term: 0,
        kind,
        session_id,
        sequence,
        timestamp_ns: 0,
        payload,
    }
}

impl<S: StateMachine> RaftNode<S> {
    pub(super) fn handle_client_request(&mut self, client: Address, request: ClientRequest, now: Instant) {
        let waiter = Waiter {
            client,
            request_id: request.request_id,
            deadline: now + self.config.request_timeout,
        };
        match request.kind {
            RequestKind::Register { client_id, timeout_ms } => {
                let timeout = self.config.clamp_session_timeout(Duration::from_millis(timeout_ms));
                let registration = Registration {
                    client_id,
                    timeout_ns: timeout.as_nanos() as u64,
                };
                match bincode::serialize(&registration) {
                    Ok(payload) => self.append_session_entry(waiter, entry(EntryKind::Register, 0, 0, payload), now),
                    Err(e) => self.reply(&waiter, Err(ClientError::Unavailable(e.to_string()))),
                }
            }
            RequestKind::KeepAlive {
                session_id,
                ack_sequence,
            } => {
                if self.reject_dead_session(&waiter, session_id) {
                    return;
                }
                let keep_alive = entry(EntryKind::KeepAlive, session_id, ack_sequence, Vec::new());
                self.append_session_entry(waiter, keep_alive, now);
            }
            RequestKind::Close { session_id } => {
                if self.reject_dead_session(&waiter, session_id) {
                    return;
                }
                self.append_session_entry(waiter, entry(EntryKind::Unregister, session_id, 0, Vec::new()), now);
            }
            RequestKind::Command {
                session_id,
                sequence,
                operation,
                consistency,
            } => self.handle_command(waiter, session_id, sequence, operation, consistency, now),
            RequestKind::Query {
                session_id,
                sequence,
                index,
                operation,
                consistency,
            } => self.handle_query(waiter, session_id, sequence, index, operation, consistency, now),
        }
    }

    fn not_leader(&self, waiter: &Waiter) {
        self.reply(
            waiter,
            Err(ClientError::NotLeader {
                leader_hint: self.leader_id,
            }),
        );
    }

    /// Answer right away for a session this node already knows is gone.
    /// Returns whether the request was answered.
    fn reject_dead_session(&self, waiter: &Waiter, session_id: SessionId) -> bool {
        if self.role != NodeRole::Leader {
            self.not_leader(waiter);
            return true;
        }
        match self.executor.sessions().get(session_id) {
            Err(e) if session_id <= self.executor.last_applied() => {
                self.reply(waiter, Err(e.into()));
                true
            }
            _ => false,
        }
    }

    /// Append a session lifecycle entry and answer when it applies.
    fn append_session_entry(&mut self, waiter: Waiter, new_entry: NewEntry, now: Instant) {
        if self.role != NodeRole::Leader {
            self.not_leader(&waiter);
            return;
        }
        let kind = new_entry.kind;
        match self.append_local(new_entry, now) {
            Ok(index) => {
                tracing::debug!(node_id = self.id, index, ?kind, "session entry appended");
                let term = self.current_term();
                self.pending.add_write(index, PendingWrite { waiter, term });
                self.replicate(now);
            }
            Err(e) => self.fail_append(&waiter, &e, now),
        }
    }

    fn fail_append(&mut self, waiter: &Waiter, error: &RaftError, now: Instant) {
        self.reply(waiter, Err(ClientError::Unavailable("log append failed".into())));
        self.on_storage_fault(error, now);
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    fn handle_command(
        &mut self,
        waiter: Waiter,
        session_id: SessionId,
        sequence: u64,
        operation: Operation,
        consistency: CommandConsistency,
        now: Instant,
    ) {
        if let CommandRoute::Redirect { leader_hint } = route_command(&self.read_context(now), consistency) {
            self.reply(&waiter, Err(ClientError::NotLeader { leader_hint }));
            return;
        }

        let applied_sequence = match self.executor.sessions().get(session_id) {
            Ok(session) => session.last_applied_sequence,
            Err(e) if session_id <= self.executor.last_applied() => {
                self.reply(&waiter, Err(e.into()));
                return;
            }
            Err(_) => {
                // Registered, but not applied here yet.
                self.reply(&waiter, Err(ClientError::Unavailable("session not applied yet".into())));
                return;
            }
        };

        let (appended, in_tail) = self.tail_sequences(session_id, sequence);
        match route_sequence(applied_sequence, appended, in_tail, sequence) {
            SequenceRoute::Cached => self.reply_cached(&waiter, session_id, sequence),
            SequenceRoute::Attach { index } => {
                let term = self.log.term_at(index).unwrap_or(0);
                self.pending.add_write(index, PendingWrite { waiter, term });
            }
            SequenceRoute::Append => {
                if !self.append_command(waiter, session_id, sequence, &operation, now) {
                    return;
                }
                let mut next = sequence + 1;
                while let Some(queued) = self.pending.take_queued(session_id, next) {
                    if !self.append_command(queued.waiter, session_id, next, &queued.operation, now) {
                        return;
                    }
                    next += 1;
                }
                self.replicate(now);
            }
            SequenceRoute::Hold => {
                tracing::debug!(node_id = self.id, session_id, sequence, "holding out-of-order command");
                self.pending.queue_command(
                    session_id,
                    sequence,
                    QueuedCommand { waiter, operation },
                );
            }
        }
    }

    /// Highest command sequence of `session_id` in the unapplied tail, and
    /// the index holding `sequence` if it is there.
    fn tail_sequences(&self, session_id: SessionId, sequence: u64) -> (u64, Option<LogIndex>) {
        let mut appended = 0;
        let mut in_tail = None;
        for e in self.log.iter_range(self.executor.last_applied(), self.log.last_index()) {
            if e.kind == EntryKind::Command && e.session_id == session_id {
                appended = appended.max(e.sequence);
                if e.sequence == sequence {
                    in_tail = Some(e.index);
                }
            }
        }
        (appended, in_tail)
    }

    fn reply_cached(&self, waiter: &Waiter, session_id: SessionId, sequence: u64) {
        let result = match self.executor.sessions().check_sequence(session_id, sequence) {
            Ok(SequenceCheck::Duplicate(cached)) => cached
                .result
                .map(|bytes| ClientReply::Output {
                    index: cached.index,
                    output: bytes,
                })
                .map_err(ClientError::Operation),
            Ok(SequenceCheck::Stale) | Ok(SequenceCheck::Apply) => {
                Err(ClientError::Operation(OperationError::StaleSequence { session_id, sequence }))
            }
            Err(e) => Err(e.into()),
        };
        self.reply(waiter, result);
    }

    /// Append one command. Returns false if the log write failed.
    fn append_command(
        &mut self,
        waiter: Waiter,
        session_id: SessionId,
        sequence: u64,
        operation: &Operation,
        now: Instant,
    ) -> bool {
        let payload = match bincode::serialize(operation) {
            Ok(payload) => payload,
            Err(e) => {
                let error = OperationError::Encode {
                    name: operation.name.clone(),
                    reason: e.to_string(),
                };
                self.reply(&waiter, Err(ClientError::Operation(error)));
                return true;
            }
        };
        match self.append_local(entry(EntryKind::Command, session_id, sequence, payload), now) {
            Ok(index) => {
                let term = self.current_term();
                self.pending.add_write(index, PendingWrite { waiter, term });
                true
            }
            Err(e) => {
                self.fail_append(&waiter, &e, now);
                false
            }
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn handle_query(
        &mut self,
        waiter: Waiter,
        session_id: SessionId,
        sequence: u64,
        client_index: LogIndex,
        operation: Operation,
        consistency: QueryConsistency,
        now: Instant,
    ) {
        let ctx = self.read_context(now);
        let condition = match route_query(&ctx, consistency, client_index) {
            QueryRoute::Redirect { leader_hint } => {
                self.reply(&waiter, Err(ClientError::NotLeader { leader_hint }));
                return;
            }
            QueryRoute::WaitApplied { index } => ReadCondition::Applied { index },
            QueryRoute::ReadIndex { read_index } => {
                let round = self.broadcast_heartbeat(now);
                ReadCondition::ReadIndex {
                    read_index,
                    round,
                    term: self.current_term(),
                }
            }
            QueryRoute::LogMarker => match self.append_local(entry(EntryKind::QueryMarker, session_id, 0, Vec::new()), now) {
                Ok(index) => {
                    self.replicate(now);
                    ReadCondition::Marker {
                        index,
                        term: self.current_term(),
                    }
                }
                Err(e) => {
                    self.fail_append(&waiter, &e, now);
                    return;
                }
            },
        };
        if self.role != NodeRole::Leader && consistency.leader_only() {
            // Lost leadership while confirming it.
            self.not_leader(&waiter);
            return;
        }
        self.pending.add_read(PendingRead {
            waiter,
            session_id,
            sequence,
            operation,
            condition,
            leader_only: consistency.leader_only(),
        });
        self.serve_ready_reads();
    }

    /// Serve every pending read whose condition now holds.
    pub(crate) fn serve_ready_reads(&mut self) {
        if self.pending.read_count() == 0 {
            return;
        }
        let applied = self.executor.last_applied();
        let term = self.current_term();
        let quorum_round = match (&self.leader, self.role) {
            (Some(leader), NodeRole::Leader) => leader.rounds.quorum_round(self.executor.members(), self.id),
            _ => 0,
        };
        let executor = &self.executor;
        let ready = self.pending.take_reads(|read| {
            let condition_met = match read.condition {
                ReadCondition::Applied { index } => applied >= index,
                ReadCondition::ReadIndex {
                    read_index,
                    round,
                    term: read_term,
                } => read_term == term && quorum_round >= round && applied >= read_index,
                ReadCondition::Marker { index, .. } => applied >= index,
            };
            let session_caught_up = match executor.sessions().get(read.session_id) {
                Ok(session) => session.last_applied_sequence >= read.sequence,
                Err(_) => read.session_id <= applied,
            };
            condition_met && session_caught_up
        });

        for read in ready {
            let result = self.serve_read(&read);
            self.reply(&read.waiter, result);
        }
    }

    fn serve_read(&self, read: &PendingRead) -> Result<ClientReply, ClientError> {
        if let ReadCondition::Marker { index, term } = read.condition {
            if self.log.term_at(index).is_some_and(|t| t != term) {
                return Err(ClientError::NotLeader {
                    leader_hint: self.leader_id,
                });
            }
        }
        self.executor.sessions().get(read.session_id)?;
        match self.executor.query(read.session_id, read.sequence, &read.operation) {
            Ok(bytes) => Ok(ClientReply::Output {
                index: self.executor.last_applied(),
                output: bytes,
            }),
            Err(e) => Err(ClientError::Operation(e)),
        }
    }

    // =========================================================================
    // SESSION EXPIRY
    // =========================================================================

    /// Append EXPIRE entries for sessions idle past their timeout.
    pub(super) fn expire_idle_sessions(&mut self, now: Instant) {
        let Some(leader) = &self.leader else {
            return;
        };
        if self.commit_index < leader.term_start_index {
            return;
        }
        let now_ns = self.clock.unix_ns(now).max(self.last_timestamp_ns);

        // Sessions with a keep-alive or command still in flight are not idle.
        let active: HashSet<SessionId> = self
            .log
            .iter_range(self.executor.last_applied(), self.log.last_index())
            .filter(|e| matches!(e.kind, EntryKind::KeepAlive | EntryKind::Command | EntryKind::Expire))
            .map(|e| e.session_id)
            .collect();
        let idle: Vec<SessionId> = self
            .executor
            .sessions()
            .expired_sessions(now_ns, leader.since_ns)
            .into_iter()
            .filter(|id| !leader.expiring.contains(id) && !active.contains(id))
            .collect();
        if idle.is_empty() {
            return;
        }

        for session_id in idle {
            match self.append_local(entry(EntryKind::Expire, session_id, 0, Vec::new()), now) {
                Ok(index) => {
                    tracing::info!(node_id = self.id, session_id, index, "expiring idle session");
                    if let Some(leader) = self.leader.as_mut() {
                        leader.expiring.insert(session_id);
                    }
                }
                Err(e) => {
                    self.on_storage_fault(&e, now);
                    return;
                }
            }
        }
        self.replicate(now);
    }

    // =========================================================================
    // CONFIGURATION
    // =========================================================================

    /// Replace the member set. Takes effect on every node when the entry
    /// applies.
    pub fn propose_configuration(&mut self, members: Vec<NodeId>, now: Instant) -> Result<LogIndex, RaftError> {
        if self.role != NodeRole::Leader {
            return Err(RaftError::NotLeader);
        }
        let pending = self
            .log
            .iter_range(self.executor.last_applied(), self.log.last_index())
            .any(|e| e.kind == EntryKind::Configuration);
        if pending {
            return Err(RaftError::ConfigurationPending);
        }
        let payload = bincode::serialize(&members).map_err(|e| RaftError::Encoding(e.to_string()))?;
        let index = match self.append_local(entry(EntryKind::Configuration, 0, 0, payload), now) {
            Ok(index) => index,
            Err(e) => {
                self.on_storage_fault(&e, now);
                return Err(e);
            }
        };
        tracing::info!(node_id = self.id, index, ?members, "configuration proposed");
        self.replicate(now);
        Ok(index)
    }
}

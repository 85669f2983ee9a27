//! Log replication, commit advancement and snapshot transfer.

use std::time::Instant;

use crate::engine::{LogEntry, LogIndex, NodeId, Term};
use crate::kernel::executor::ExecutorError;
use crate::kernel::snapshot::{SnapshotFile, SNAPSHOT_FILE_NAME};
use crate::kernel::traits::StateMachine;
use crate::raft::error::RaftError;
use crate::raft::message::RaftMessage;
use crate::raft::quorum::quorum_match_index;

use super::{NodeRole, RaftNode};

impl<S: StateMachine> RaftNode<S> {
    // =========================================================================
    // LEADER: SENDING
    // =========================================================================

    /// Start a heartbeat round and send to every peer.
    pub(crate) fn broadcast_heartbeat(&mut self, now: Instant) -> u64 {
        self.heartbeat_deadline = now + self.heartbeat_interval();
        let Some(leader) = self.leader.as_mut() else {
            return 0;
        };
        let round = leader.rounds.start_round(now);
        for peer in self.peers() {
            self.send_append(peer, round);
        }
        // A lone leader confirms its own rounds.
        self.advance_leader_commit(now);
        round
    }

    /// Send new entries to peers with nothing in flight.
    pub(crate) fn replicate(&mut self, now: Instant) {
        let Some(leader) = &self.leader else {
            return;
        };
        let round = leader.rounds.current();
        let idle: Vec<NodeId> = self
            .peers()
            .into_iter()
            .filter(|p| !leader.in_flight.contains(p))
            .collect();
        for peer in idle {
            self.send_append(peer, round);
        }
        self.advance_leader_commit(now);
    }

    fn send_append(&mut self, peer: NodeId, round: u64) {
        let term = self.current_term();
        let last = self.log.last_index();
        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        let next = leader.next_index.entry(peer).or_insert(last + 1);
        *next = (*next).min(last + 1);
        let next = *next;
        leader.in_flight.insert(peer);

        if next <= self.log.base_index() {
            self.send_snapshot(peer, round);
            return;
        }
        let prev_log_index = next - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            self.send_snapshot(peer, round);
            return;
        };
        let entries = self.log.entries_from(next, self.config.max_entries_per_append);
        tracing::trace!(node_id = self.id, peer, next, count = entries.len(), round, "append entries");
        self.send(
            peer,
            RaftMessage::AppendEntries {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
                round,
            },
        );
    }

    fn send_snapshot(&mut self, peer: NodeId, round: u64) {
        if self.latest_snapshot.is_none() {
            match SnapshotFile::load_if_present(&self.dir.join(SNAPSHOT_FILE_NAME)) {
                Ok(snapshot) => self.latest_snapshot = snapshot,
                Err(e) => tracing::error!(node_id = self.id, error = %e, "failed to load snapshot"),
            }
        }
        let Some(snapshot) = &self.latest_snapshot else {
            tracing::error!(node_id = self.id, peer, "peer needs compacted entries but no snapshot exists");
            return;
        };
        tracing::info!(
            node_id = self.id,
            peer,
            last_included_index = snapshot.last_included_index,
            "sending snapshot"
        );
        self.send(
            peer,
            RaftMessage::InstallSnapshot {
                term: self.current_term(),
                leader_id: self.id,
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                data: snapshot.to_bytes(),
                round,
            },
        );
    }

    /// Commit the highest current-term index stored on a majority.
    pub(crate) fn advance_leader_commit(&mut self, now: Instant) {
        let Some(leader) = &self.leader else {
            return;
        };
        let candidate = quorum_match_index(
            self.executor.members(),
            self.id,
            self.log.last_index(),
            &leader.match_index,
        );
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term()) {
            tracing::debug!(node_id = self.id, commit_index = candidate, "commit advanced");
            self.advance_commit(candidate, now);
        }
    }

    // =========================================================================
    // LEADER: RESPONSES
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_append_response(
        &mut self,
        from: NodeId,
        term: Term,
        success: bool,
        match_index: LogIndex,
        conflict_index: LogIndex,
        round: u64,
        now: Instant,
    ) {
        if term > self.current_term() {
            self.become_follower(term, None, now);
            return;
        }
        if self.role != NodeRole::Leader || term < self.current_term() {
            return;
        }
        let last = self.log.last_index();
        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        leader.rounds.ack(from, round);
        leader.in_flight.remove(&from);
        let matched = leader.match_index.entry(from).or_insert(0);

        let resend = if success {
            *matched = (*matched).max(match_index);
            let next = *matched + 1;
            leader.next_index.insert(from, next);
            next <= last
        } else if conflict_index > 0 {
            let next = conflict_index.max(*matched + 1);
            tracing::debug!(node_id = self.id, peer = from, next, "follower log mismatch, rewinding");
            leader.next_index.insert(from, next);
            true
        } else {
            // The follower could not write; wait for the next heartbeat.
            false
        };
        let current_round = leader.rounds.current();

        if success {
            self.advance_leader_commit(now);
        }
        if resend && self.role == NodeRole::Leader {
            self.send_append(from, current_round);
        }
        self.serve_ready_reads();
    }

    pub(super) fn handle_snapshot_response(
        &mut self,
        from: NodeId,
        term: Term,
        success: bool,
        last_included_index: LogIndex,
        round: u64,
        now: Instant,
    ) {
        if term > self.current_term() {
            self.become_follower(term, None, now);
            return;
        }
        if self.role != NodeRole::Leader || term < self.current_term() {
            return;
        }
        let last = self.log.last_index();
        let Some(leader) = self.leader.as_mut() else {
            return;
        };
        leader.rounds.ack(from, round);
        leader.in_flight.remove(&from);
        if !success {
            return;
        }
        let matched = leader.match_index.entry(from).or_insert(0);
        *matched = (*matched).max(last_included_index);
        let next = *matched + 1;
        leader.next_index.insert(from, next);
        let current_round = leader.rounds.current();

        self.advance_leader_commit(now);
        if next <= last && self.role == NodeRole::Leader {
            self.send_append(from, current_round);
        }
        self.serve_ready_reads();
    }

    // =========================================================================
    // FOLLOWER
    // =========================================================================

    /// Accept `leader_id` as leader of `term`. Returns false if the term
    /// could not be adopted.
    fn follow(&mut self, term: Term, leader_id: NodeId, now: Instant) -> bool {
        if term > self.current_term() || self.role != NodeRole::Follower {
            self.become_follower(term, Some(leader_id), now);
        }
        if term != self.current_term() {
            return false;
        }
        if self.leader_id != Some(leader_id) {
            tracing::info!(node_id = self.id, term, leader_id, "following leader");
        }
        self.leader_id = Some(leader_id);
        self.last_leader_contact = Some(now);
        self.reset_election_timer(now);
        true
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_append_entries(
        &mut self,
        from: NodeId,
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
        round: u64,
        now: Instant,
    ) {
        let respond = |node: &Self, success: bool, match_index: LogIndex, conflict_index: LogIndex| {
            node.send(
                from,
                RaftMessage::AppendEntriesResponse {
                    term: node.current_term(),
                    success,
                    match_index,
                    conflict_index,
                    round,
                },
            );
        };

        if term < self.current_term() {
            respond(self, false, 0, 0);
            return;
        }
        if !self.follow(term, leader_id, now) {
            return;
        }

        // Entries at or below the compaction base are committed and match.
        let base = self.log.base_index();
        let matches = prev_log_index < base || self.log.term_at(prev_log_index) == Some(prev_log_term);
        if !matches {
            let conflict_index = self.conflict_index(prev_log_index);
            tracing::debug!(
                node_id = self.id,
                prev_log_index,
                prev_log_term,
                conflict_index,
                "log mismatch"
            );
            respond(self, false, 0, conflict_index);
            return;
        }

        match self.log.append_entries(&entries) {
            Ok(written) => {
                if written > 0 {
                    self.storage_faulted = false;
                    if let Some(last) = entries.last() {
                        self.last_timestamp_ns = self.last_timestamp_ns.max(last.timestamp_ns);
                    }
                }
            }
            Err(e) => {
                tracing::error!(node_id = self.id, term, error = %e, "follower append failed");
                self.storage_faulted = true;
                respond(self, false, 0, 0);
                return;
            }
        }

        let match_index = prev_log_index + entries.len() as u64;
        respond(self, true, match_index, 0);
        self.advance_commit(leader_commit.min(match_index), now);
    }

    /// First index of the term that conflicts at `prev_log_index`, or the
    /// end of the log if it is too short.
    fn conflict_index(&self, prev_log_index: LogIndex) -> LogIndex {
        let last = self.log.last_index();
        if prev_log_index > last {
            return last + 1;
        }
        let base = self.log.base_index();
        let Some(term) = self.log.term_at(prev_log_index) else {
            return base + 1;
        };
        let mut index = prev_log_index;
        while index > base + 1 && self.log.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index.max(1)
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        term: Term,
        leader_id: NodeId,
        last_included_index: LogIndex,
        last_included_term: Term,
        data: Vec<u8>,
        round: u64,
        now: Instant,
    ) {
        let respond = |node: &Self, success: bool| {
            node.send(
                from,
                RaftMessage::InstallSnapshotResponse {
                    term: node.current_term(),
                    success,
                    last_included_index,
                    round,
                },
            );
        };

        if term < self.current_term() {
            respond(self, false);
            return;
        }
        if !self.follow(term, leader_id, now) {
            return;
        }
        if last_included_index <= self.executor.last_applied() {
            respond(self, true);
            return;
        }

        match self.install_snapshot(&data, last_included_index, last_included_term, now) {
            Ok(()) => respond(self, true),
            Err(e) => {
                tracing::error!(node_id = self.id, last_included_index, error = %e, "snapshot install failed");
                respond(self, false);
            }
        }
    }

    fn install_snapshot(
        &mut self,
        data: &[u8],
        index: LogIndex,
        term: Term,
        now: Instant,
    ) -> Result<(), RaftError> {
        let snapshot = SnapshotFile::from_bytes(data)?;
        if snapshot.last_included_index != index || snapshot.last_included_term != term {
            return Err(ExecutorError::Restore(format!(
                "snapshot header ({}, {}) does not match message ({index}, {term})",
                snapshot.last_included_index, snapshot.last_included_term
            ))
            .into());
        }
        snapshot.save(&self.dir.join(SNAPSHOT_FILE_NAME))?;
        self.log.reset_to_snapshot(index, term)?;
        if let Err(e) = self.executor.restore(&snapshot) {
            // The log no longer holds what the executor would need to
            // catch up from its old position.
            self.storage_faulted = true;
            return Err(e.into());
        }
        self.commit_index = self.commit_index.max(index);
        tracing::info!(node_id = self.id, index, term, "installed snapshot");
        self.latest_snapshot = Some(snapshot);
        self.apply_committed(now);
        Ok(())
    }
}

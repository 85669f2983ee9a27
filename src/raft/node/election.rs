//! Elections, votes and leadership upkeep.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::engine::{LogIndex, NewEntry, NodeId, Term};
use crate::kernel::traits::StateMachine;
use crate::raft::message::RaftMessage;
use crate::raft::quorum::{majority, RoundTracker};

use super::{LeaderState, NodeRole, RaftNode};

impl<S: StateMachine> RaftNode<S> {
    /// Heard from a leader recently enough that an election now would
    /// only be a disruption.
    fn has_recent_leader(&self, now: Instant) -> bool {
        if self.role == NodeRole::Leader {
            return true;
        }
        self.last_leader_contact
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.election_timeout_min)
    }

    pub(super) fn start_election(&mut self, now: Instant) {
        self.reset_election_timer(now);
        if !self.executor.members().contains(&self.id) {
            return;
        }
        if self.storage_faulted {
            tracing::warn!(node_id = self.id, "storage faulted, not campaigning");
            return;
        }

        let term = self.current_term() + 1;
        if let Err(e) = self
            .manifest
            .advance_term(term)
            .and_then(|_| self.manifest.record_vote(term, self.id))
        {
            tracing::error!(node_id = self.id, term, error = %e, "failed to persist candidacy");
            self.storage_faulted = true;
            return;
        }

        self.role = NodeRole::Candidate;
        self.leader_id = None;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id);
        tracing::info!(
            node_id = self.id,
            term,
            last_log_index = self.log.last_index(),
            last_log_term = self.log.last_term(),
            "starting election"
        );

        if self.votes.count_in(self.executor.members()) >= majority(self.executor.members().len()) {
            self.become_leader(now);
            return;
        }
        let request = RaftMessage::RequestVote {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.peers() {
            self.send(peer, request.clone());
        }
    }

    pub(super) fn handle_request_vote(
        &mut self,
        from: NodeId,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
        now: Instant,
    ) {
        let reject = |node: &Self| RaftMessage::RequestVoteResponse {
            term: node.current_term(),
            vote_granted: false,
        };

        if self.storage_faulted {
            self.send(from, reject(self));
            return;
        }
        if term > self.current_term() && self.has_recent_leader(now) {
            tracing::debug!(node_id = self.id, candidate_id, term, "ignoring vote request, leader is live");
            self.send(from, reject(self));
            return;
        }
        if term > self.current_term() {
            self.become_follower(term, None, now);
        }
        if term != self.current_term() {
            self.send(from, reject(self));
            return;
        }

        let up_to_date = (last_log_term, last_log_index) >= (self.log.last_term(), self.log.last_index());
        let free = self.manifest.voted_for().map_or(true, |v| v == candidate_id);
        let mut granted = up_to_date && free;
        if granted {
            if let Err(e) = self.manifest.record_vote(term, candidate_id) {
                tracing::error!(node_id = self.id, term, candidate_id, error = %e, "failed to persist vote");
                granted = false;
            } else {
                self.reset_election_timer(now);
            }
        }
        tracing::debug!(node_id = self.id, term, candidate_id, granted, up_to_date, "vote request");
        self.send(
            from,
            RaftMessage::RequestVoteResponse {
                term: self.current_term(),
                vote_granted: granted,
            },
        );
    }

    pub(super) fn handle_vote_response(&mut self, from: NodeId, term: Term, vote_granted: bool, now: Instant) {
        if term > self.current_term() {
            self.become_follower(term, None, now);
            return;
        }
        if self.role != NodeRole::Candidate || term < self.current_term() || !vote_granted {
            return;
        }
        self.votes.insert(from);
        let members = self.executor.members();
        if self.votes.count_in(members) >= majority(members.len()) {
            self.become_leader(now);
        }
    }

    fn become_leader(&mut self, now: Instant) {
        let term = self.current_term();
        let next = self.log.last_index() + 1;
        let peers = self.peers();
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        self.leader = Some(LeaderState {
            next_index: peers.iter().map(|&p| (p, next)).collect::<HashMap<_, _>>(),
            match_index: HashMap::new(),
            in_flight: HashSet::new(),
            rounds: RoundTracker::new(),
            since: now,
            since_ns: 0,
            term_start_index: next,
            expiring: HashSet::new(),
        });
        tracing::info!(node_id = self.id, term, last_log_index = next - 1, "became leader");

        match self.append_local(NewEntry::no_op(term, 0), now) {
            Ok(index) => {
                let ts = self.last_timestamp_ns;
                if let Some(leader) = self.leader.as_mut() {
                    leader.term_start_index = index;
                    leader.since_ns = ts;
                }
            }
            Err(e) => {
                self.on_storage_fault(&e, now);
                return;
            }
        }
        self.broadcast_heartbeat(now);
        self.advance_leader_commit(now);
    }

    /// Step down if no heartbeat round has reached a majority recently.
    /// Returns whether this node is still leader.
    pub(super) fn check_quorum(&mut self, now: Instant) -> bool {
        let Some(leader) = &self.leader else {
            return false;
        };
        let contact = leader
            .rounds
            .quorum_round_start(self.executor.members(), self.id)
            .unwrap_or(leader.since);
        if now.saturating_duration_since(contact) <= self.config.election_timeout_max {
            return true;
        }
        tracing::warn!(
            node_id = self.id,
            term = self.current_term(),
            "lost contact with a majority"
        );
        self.become_follower(self.current_term(), None, now);
        false
    }
}

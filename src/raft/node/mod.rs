//! The per-node consensus state machine.
//!
//! A `RaftNode` is a single sequencer: every state change happens inside
//! `&mut self`, driven by `handle` (one inbound message) and `tick` (timers).
//! Callers pass the current `Instant` in, so the node never reads the clock
//! itself and a simulation can run it on virtual time.

mod election;
mod replication;
mod requests;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::engine::fault_injection::FaultInjector;
use crate::engine::{DurableLog, LogEntry, LogIndex, Manifest, NewEntry, NodeId, Term};
use crate::kernel::executor::{ApplyOutcome, Executor, ExecutorError};
use crate::kernel::session::SessionId;
use crate::kernel::snapshot::{SnapshotFile, SNAPSHOT_FILE_NAME};
use crate::kernel::traits::StateMachine;

use super::dispatcher::ReadContext;
pub use super::dispatcher::NodeRole;
use super::error::{ClientError, RaftError};
use super::message::{Address, ClientReply, ClientResponse, Envelope, Message, RaftMessage};
use super::network::Endpoint;
use super::pending::{PendingTable, Waiter};
use super::quorum::{NodeBitset, RoundTracker};

pub const META_FILE_NAME: &str = "meta";

/// Point-in-time view of a node, for observers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub halted: bool,
}

/// Maps the caller's `Instant`s to wall-clock nanoseconds for entry
/// timestamps.
#[derive(Debug, Clone, Copy)]
pub struct ClockOrigin {
    pub instant: Instant,
    pub unix_ns: u64,
}

impl ClockOrigin {
    pub fn new(instant: Instant) -> Self {
        let unix_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        ClockOrigin { instant, unix_ns }
    }

    pub fn unix_ns(&self, now: Instant) -> u64 {
        self.unix_ns + now.saturating_duration_since(self.instant).as_nanos() as u64
    }
}

/// Leader-only replication state, reset on every election win.
#[derive(Debug)]
struct LeaderState {
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    /// Peers with an unanswered append or snapshot.
    in_flight: HashSet<NodeId>,
    rounds: RoundTracker,
    since: Instant,
    /// Log time of the leadership no-op; the floor for session expiry.
    since_ns: u64,
    /// Index of the no-op appended on election.
    term_start_index: LogIndex,
    /// Sessions with an EXPIRE entry appended but not yet applied.
    expiring: HashSet<SessionId>,
}

pub struct RaftNode<S: StateMachine> {
    id: NodeId,
    config: NodeConfig,
    dir: PathBuf,
    log: DurableLog,
    manifest: Manifest,
    executor: Executor<S>,
    endpoint: Endpoint,

    role: NodeRole,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    votes: NodeBitset,
    leader: Option<LeaderState>,

    rng: StdRng,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    /// Last time a current leader's append or snapshot arrived.
    last_leader_contact: Option<Instant>,

    pending: PendingTable,
    latest_snapshot: Option<SnapshotFile>,
    /// Set when a log write failed and cleared by the next successful one.
    storage_faulted: bool,
    clock: ClockOrigin,
    last_timestamp_ns: u64,
    stopped: bool,
}

impl<S: StateMachine> RaftNode<S> {
    /// Open a node's persistent state in `dir`, creating it on first start.
    ///
    /// `members` is the bootstrap member set, used until a configuration
    /// entry or snapshot says otherwise.
    pub fn open(
        id: NodeId,
        dir: &Path,
        members: Vec<NodeId>,
        config: NodeConfig,
        machine: S,
        endpoint: Endpoint,
        now: Instant,
    ) -> Result<Self, RaftError> {
        config.validate()?;
        if !members.contains(&id) {
            return Err(RaftError::NotMember(id));
        }
        std::fs::create_dir_all(dir)?;

        let manifest = Manifest::open(&dir.join(META_FILE_NAME))?;
        let (mut log, outcome) = DurableLog::open(dir)?;
        let mut executor = Executor::new(machine, members);

        let latest_snapshot = SnapshotFile::load_if_present(&dir.join(SNAPSHOT_FILE_NAME))?;
        if let Some(snapshot) = &latest_snapshot {
            executor.restore(snapshot)?;
            // A crash between saving the snapshot and compacting leaves a
            // longer log behind. Finish the compaction now.
            log.reset_to_snapshot(snapshot.last_included_index, snapshot.last_included_term)?;
        }
        if log.base_index() > executor.last_applied() {
            return Err(RaftError::Log(crate::engine::LogError::Compacted {
                index: executor.last_applied() + 1,
                base_index: log.base_index(),
            }));
        }
        let commit_index = executor.last_applied();
        log.set_commit_floor(commit_index);

        let rng = match config.election_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            None => StdRng::from_entropy(),
        };
        let last_timestamp_ns = log
            .get(log.last_index())
            .map(|e| e.timestamp_ns)
            .unwrap_or(executor.last_time().as_nanos());

        let mut node = RaftNode {
            id,
            config,
            dir: dir.to_path_buf(),
            log,
            manifest,
            executor,
            endpoint,
            role: NodeRole::Follower,
            leader_id: None,
            commit_index,
            votes: NodeBitset::new(),
            leader: None,
            rng,
            election_deadline: now,
            heartbeat_deadline: now,
            last_leader_contact: None,
            pending: PendingTable::new(),
            latest_snapshot,
            storage_faulted: false,
            clock: ClockOrigin::new(now),
            last_timestamp_ns,
            stopped: false,
        };
        node.reset_election_timer(now);
        tracing::info!(
            node_id = id,
            term = node.current_term(),
            last_index = node.log.last_index(),
            commit_index,
            recovery = ?outcome,
            "node opened"
        );
        Ok(node)
    }

    /// Share one wall-clock origin between nodes on the same virtual clock.
    pub fn set_clock_origin(&mut self, origin: ClockOrigin) {
        self.clock = origin;
    }

    pub fn set_fault_injector(&mut self, faults: FaultInjector) {
        self.log.set_fault_injector(faults);
    }

    // =========================================================================
    // DRIVING
    // =========================================================================

    /// Drain the inbox, then run timers.
    pub fn step(&mut self, now: Instant) -> usize {
        let handled = self.process_all(now);
        self.tick(now);
        handled
    }

    /// Handle every message currently queued. Returns how many.
    pub fn process_all(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while let Some(envelope) = self.endpoint.try_recv() {
            self.handle(envelope, now);
            handled += 1;
        }
        handled
    }

    pub fn handle(&mut self, envelope: Envelope, now: Instant) {
        if self.stopped {
            return;
        }
        match (envelope.from, envelope.message) {
            (Address::Node(from), Message::Raft(msg)) => self.handle_raft(from, msg, now),
            (client, Message::Request(request)) => self.handle_client_request(client, request, now),
            (from, Message::Response(_)) => {
                tracing::debug!(node_id = self.id, ?from, "ignoring stray client response");
            }
            (from, Message::Raft(_)) => {
                tracing::debug!(node_id = self.id, ?from, "ignoring raft message from non-node");
            }
        }
    }

    fn handle_raft(&mut self, from: NodeId, msg: RaftMessage, now: Instant) {
        match msg {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_request_vote(from, term, candidate_id, last_log_index, last_log_term, now),
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                self.handle_vote_response(from, term, vote_granted, now)
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                round,
            } => self.handle_append_entries(
                from,
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                round,
                now,
            ),
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
                conflict_index,
                round,
            } => self.handle_append_response(from, term, success, match_index, conflict_index, round, now),
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
                round,
            } => self.handle_install_snapshot(
                from,
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
                round,
                now,
            ),
            RaftMessage::InstallSnapshotResponse {
                term,
                success,
                last_included_index,
                round,
            } => self.handle_snapshot_response(from, term, success, last_included_index, round, now),
        }
    }

    /// Run timers: elections, heartbeats, check-quorum, session expiry and
    /// request deadlines.
    pub fn tick(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        match self.role {
            NodeRole::Leader => {
                if self.check_quorum(now) {
                    if now >= self.heartbeat_deadline {
                        self.broadcast_heartbeat(now);
                    }
                    self.expire_idle_sessions(now);
                }
            }
            NodeRole::Follower | NodeRole::Candidate => {
                if now >= self.election_deadline {
                    self.start_election(now);
                }
            }
        }
        for (waiter, error) in self.pending.expire(now) {
            self.reply(&waiter, Err(error));
        }
    }

    /// Stop the node: timers stop firing, inbound messages are ignored and
    /// every waiting request fails with `Unavailable`.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for waiter in self.pending.drain_all() {
            self.reply(&waiter, Err(ClientError::Unavailable("node shut down".into())));
        }
        tracing::info!(node_id = self.id, term = self.current_term(), "node stopped");
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_deadline(&self) -> Instant {
        match self.role {
            NodeRole::Leader => self.heartbeat_deadline,
            _ => self.election_deadline,
        }
    }

    // =========================================================================
    // ROLE TRANSITIONS
    // =========================================================================

    fn reset_election_timer(&mut self, now: Instant) {
        let timeout = self.config.random_election_timeout(&mut self.rng);
        self.election_deadline = now + timeout;
    }

    /// Adopt `term` (persisting it if newer) and follow `leader`.
    ///
    /// If the term cannot be persisted the node still stops acting in its
    /// old term: it follows nobody and is marked storage-faulted.
    pub(crate) fn become_follower(&mut self, term: Term, leader: Option<NodeId>, now: Instant) {
        let mut leader = leader;
        if term > self.current_term() {
            if let Err(e) = self.manifest.advance_term(term) {
                tracing::error!(node_id = self.id, term, error = %e, "failed to persist term");
                self.storage_faulted = true;
                leader = None;
            }
        }
        let was_leader = self.role == NodeRole::Leader;
        if self.role != NodeRole::Follower {
            tracing::info!(node_id = self.id, term, ?leader, from = ?self.role, "became follower");
        }
        self.role = NodeRole::Follower;
        self.leader_id = leader;
        self.leader = None;
        self.votes.clear();
        if was_leader {
            tracing::warn!(node_id = self.id, term, "stepped down");
            let hint = self.leader_id;
            for waiter in self.pending.drain_leader_only() {
                self.reply(&waiter, Err(ClientError::NotLeader { leader_hint: hint }));
            }
        }
        self.reset_election_timer(now);
    }

    // =========================================================================
    // APPLY
    // =========================================================================

    /// Raise the commit index and apply everything up to it.
    pub(crate) fn advance_commit(&mut self, index: LogIndex, now: Instant) {
        let index = index.min(self.log.last_index());
        if index <= self.commit_index {
            return;
        }
        self.commit_index = index;
        self.log.set_commit_floor(index);
        self.apply_committed(now);
    }

    fn apply_committed(&mut self, now: Instant) {
        while self.executor.last_applied() < self.commit_index && !self.executor.is_halted() {
            let next = self.executor.last_applied() + 1;
            let entry = match self.log.get(next) {
                Ok(entry) => entry.clone(),
                Err(e) => {
                    tracing::error!(node_id = self.id, index = next, error = %e, "committed entry unavailable");
                    return;
                }
            };
            match self.executor.apply(&entry) {
                Ok(outcome) => self.complete(&entry, outcome, now),
                Err(ExecutorError::PoisonPill { index, message }) => {
                    tracing::error!(node_id = self.id, index, %message, "poison pill, node stops applying");
                    return;
                }
                Err(e) => {
                    tracing::error!(node_id = self.id, index = next, error = %e, "apply failed, executor halted");
                    return;
                }
            }
        }
        self.serve_ready_reads();
        self.maybe_snapshot();
    }

    /// Answer whoever waits on an applied entry.
    fn complete(&mut self, entry: &LogEntry, outcome: ApplyOutcome, now: Instant) {
        use crate::kernel::executor::Applied;

        let reply: Result<ClientReply, ClientError> = match outcome.applied {
            Applied::Command { result, .. } => match result {
                Ok(bytes) => Ok(ClientReply::Output {
                    index: outcome.index,
                    output: bytes,
                }),
                Err(e) => Err(ClientError::Operation(e)),
            },
            Applied::CommandRejected { error, .. } => Err(error.into()),
            Applied::Registered { session_id, .. } => {
                let timeout_ms = self
                    .executor
                    .sessions()
                    .get(session_id)
                    .map(|s| s.timeout_ns / 1_000_000)
                    .unwrap_or(0);
                Ok(ClientReply::Registered {
                    session_id,
                    timeout_ms,
                    members: self.executor.members().to_vec(),
                    leader: self.leader_id,
                })
            }
            Applied::KeptAlive { result, .. } => result
                .map(|()| ClientReply::KeptAlive {
                    members: self.executor.members().to_vec(),
                    leader: self.leader_id,
                })
                .map_err(ClientError::from),
            Applied::Closed { session_id, result } => {
                self.drop_session_requests(session_id);
                result.map(|()| ClientReply::Closed).map_err(ClientError::from)
            }
            Applied::Expired { session_id } => {
                if let Some(leader) = self.leader.as_mut() {
                    leader.expiring.remove(&session_id);
                }
                self.drop_session_requests(session_id);
                return;
            }
            Applied::Configuration { members } => {
                if self.role == NodeRole::Leader && !members.contains(&self.id) {
                    tracing::warn!(node_id = self.id, "removed from configuration, stepping down");
                    self.become_follower(self.current_term(), None, now);
                }
                return;
            }
            Applied::NoOp | Applied::QueryMarker => return,
        };

        for write in self.pending.take_writes(entry.index) {
            if write.term == entry.term {
                self.reply(&write.waiter, reply.clone());
            } else {
                self.reply(
                    &write.waiter,
                    Err(ClientError::NotLeader {
                        leader_hint: self.leader_id,
                    }),
                );
            }
        }
    }

    fn drop_session_requests(&mut self, session_id: SessionId) {
        for waiter in self.pending.drop_session(session_id) {
            self.reply(&waiter, Err(ClientError::SessionClosed(session_id)));
        }
    }

    // =========================================================================
    // SNAPSHOTS
    // =========================================================================

    fn maybe_snapshot(&mut self) {
        let threshold = self.config.snapshot_threshold;
        if threshold == 0 || self.executor.is_halted() {
            return;
        }
        if self.executor.last_applied().saturating_sub(self.log.base_index()) < threshold {
            return;
        }
        if let Err(e) = self.take_snapshot() {
            tracing::error!(node_id = self.id, error = %e, "snapshot failed");
        }
    }

    /// Snapshot the executor and compact the log through `last_applied`.
    pub fn take_snapshot(&mut self) -> Result<LogIndex, RaftError> {
        let snapshot = self.executor.snapshot()?;
        let index = snapshot.last_included_index;
        snapshot.save(&self.dir.join(SNAPSHOT_FILE_NAME))?;
        self.log.compact(index)?;
        tracing::info!(node_id = self.id, index, term = snapshot.last_included_term, "snapshot taken");
        self.latest_snapshot = Some(snapshot);
        Ok(index)
    }

    // =========================================================================
    // OUTPUT
    // =========================================================================

    pub(crate) fn send(&self, to: NodeId, msg: RaftMessage) {
        self.endpoint.send(Address::Node(to), Message::Raft(msg));
    }

    pub(crate) fn reply(&self, waiter: &Waiter, result: Result<ClientReply, ClientError>) {
        self.respond(waiter.client, waiter.request_id, result);
    }

    pub(crate) fn respond(
        &self,
        client: Address,
        request_id: u64,
        result: Result<ClientReply, ClientError>,
    ) {
        self.endpoint
            .send(client, Message::Response(ClientResponse { request_id, result }));
    }

    /// Append an entry stamped with the current log time.
    pub(crate) fn append_local(&mut self, mut entry: NewEntry, now: Instant) -> Result<LogIndex, RaftError> {
        let ts = self.clock.unix_ns(now).max(self.last_timestamp_ns);
        entry.timestamp_ns = ts;
        entry.term = self.current_term();
        let index = self.log.append(entry)?;
        self.last_timestamp_ns = ts;
        self.storage_faulted = false;
        Ok(index)
    }

    /// Handle a failed local append: log it, and stop leading.
    pub(crate) fn on_storage_fault(&mut self, error: &RaftError, now: Instant) {
        tracing::error!(node_id = self.id, term = self.current_term(), %error, "log append failed");
        self.storage_faulted = true;
        if self.role == NodeRole::Leader {
            self.become_follower(self.current_term(), None, now);
        }
    }

    pub(crate) fn read_context(&self, now: Instant) -> ReadContext {
        let (term_start_index, lease_until) = match &self.leader {
            Some(leader) => (
                leader.term_start_index,
                leader
                    .rounds
                    .quorum_round_start(self.executor.members(), self.id)
                    .map(|start| start + self.config.lease_duration()),
            ),
            None => (0, None),
        };
        ReadContext {
            role: self.role,
            leader_hint: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.executor.last_applied(),
            term_start_index,
            lease_until,
            read_mode: self.config.read_mode,
            now,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    pub fn current_term(&self) -> Term {
        self.manifest.current_term()
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.manifest.voted_for()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.executor.last_applied()
    }

    pub fn members(&self) -> &[NodeId] {
        self.executor.members()
    }

    pub fn log(&self) -> &DurableLog {
        &self.log
    }

    pub fn executor(&self) -> &Executor<S> {
        &self.executor
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_storage_faulted(&self) -> bool {
        self.storage_faulted
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role,
            term: self.current_term(),
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.executor.last_applied(),
            last_log_index: self.log.last_index(),
            halted: self.executor.is_halted(),
        }
    }

    fn peers(&self) -> Vec<NodeId> {
        self.executor
            .members()
            .iter()
            .copied()
            .filter(|&id| id != self.id)
            .collect()
    }

    fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }
}

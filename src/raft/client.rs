//! Client proxy for the cluster.
//!
//! Non-blocking: submissions return an [`OperationId`] right away and
//! `poll(now)` drives responses, retries and keep-alives. `wait_for` wraps
//! the same loop for threaded callers.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;

use crate::config::{ClientConfig, ConfigError};
use crate::engine::{LogIndex, NodeId};
use crate::kernel::session::{ClientId, SessionId};
use crate::kernel::traits::{decode_output, CommandOp, Operation, OperationError, QueryOp};

use super::error::ClientError;
use super::message::{
    Address, ClientReply, ClientRequest, ClientResponse, CommandConsistency, Envelope, Message,
    QueryConsistency, RequestId, RequestKind,
};
use super::network::Endpoint;

/// Handle for one submitted command or query.
pub type OperationId = u64;

/// What a finished operation produced: the handler's encoded output.
pub type OperationOutput = Result<Vec<u8>, ClientError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Unregistered,
    Registering,
    Open(SessionId),
    /// The cluster ended the session. Call `reset_session` to start over.
    Failed(ClientError),
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
enum Submission {
    Command {
        sequence: u64,
        operation: Operation,
        consistency: CommandConsistency,
    },
    Query {
        /// Last command sequence submitted before this query.
        sequence: u64,
        operation: Operation,
        consistency: QueryConsistency,
    },
}

impl Submission {
    fn command_sequence(&self) -> Option<u64> {
        match self {
            Submission::Command { sequence, .. } => Some(*sequence),
            Submission::Query { .. } => None,
        }
    }

    fn follower_readable(&self) -> bool {
        matches!(
            self,
            Submission::Query {
                consistency: QueryConsistency::Causal | QueryConsistency::Sequential,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
enum Purpose {
    Register,
    KeepAlive { ack_sequence: u64 },
    Close { session_id: SessionId },
    User { id: OperationId, submission: Submission },
    /// A command whose caller was already told it failed. Resent until
    /// the cluster answers; later sequences of the session queue behind it.
    Resend { submission: Submission },
}

impl Purpose {
    fn submission(&self) -> Option<&Submission> {
        match self {
            Purpose::User { submission, .. } | Purpose::Resend { submission } => Some(submission),
            _ => None,
        }
    }
}

/// A request waiting for its response or its next attempt.
#[derive(Debug)]
struct Outstanding {
    purpose: Purpose,
    attempts: u32,
    target: NodeId,
    /// When the current attempt gives up.
    deadline: Instant,
    /// Set while backing off; the request is resent at this instant.
    retry_at: Option<Instant>,
}

/// Client proxy for interacting with the cluster.
///
/// Handles:
/// - Session registration and keep-alives
/// - Leader discovery and caching
/// - Automatic retry on NotLeader with exponential backoff
/// - Rotation to another member on timeouts
pub struct ClusterClient {
    client_id: ClientId,
    config: ClientConfig,
    endpoint: Endpoint,
    members: Vec<NodeId>,
    leader: Option<NodeId>,
    /// Round-robin position used when no leader is known.
    cursor: usize,
    status: SessionStatus,

    next_request_id: RequestId,
    next_operation_id: OperationId,
    next_sequence: u64,
    /// Highest log index seen in any response.
    observed_index: LogIndex,
    /// Command sequences finished but not yet contiguous with `acked`.
    completed: BTreeSet<u64>,
    /// Every sequence at or below this one has finished.
    acked: u64,
    last_keep_alive: Instant,

    outstanding: HashMap<RequestId, Outstanding>,
    /// Submitted before the session opened.
    queued: VecDeque<(OperationId, Submission)>,
    results: HashMap<OperationId, OperationOutput>,
}

impl ClusterClient {
    pub fn new(
        client_id: ClientId,
        members: Vec<NodeId>,
        config: ClientConfig,
        endpoint: Endpoint,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(ClusterClient {
            client_id,
            config,
            endpoint,
            members,
            leader: None,
            cursor: 0,
            status: SessionStatus::Unregistered,
            next_request_id: 1,
            next_operation_id: 1,
            next_sequence: 1,
            observed_index: 0,
            completed: BTreeSet::new(),
            acked: 0,
            last_keep_alive: now,
            outstanding: HashMap::new(),
            queued: VecDeque::new(),
            results: HashMap::new(),
        })
    }

    /// Register a session. Submissions made before it opens are queued.
    pub fn open(&mut self, now: Instant) {
        if !matches!(self.status, SessionStatus::Unregistered) {
            return;
        }
        self.status = SessionStatus::Registering;
        tracing::debug!(client_id = self.client_id, "registering session");
        self.start(Purpose::Register, now);
    }

    /// Forget a failed session and register a new one.
    pub fn reset_session(&mut self, now: Instant) {
        for (id, _) in std::mem::take(&mut self.queued) {
            self.results.insert(id, Err(ClientError::Unavailable("session reset".into())));
        }
        self.outstanding.clear();
        self.next_sequence = 1;
        self.completed.clear();
        self.acked = 0;
        self.status = SessionStatus::Unregistered;
        self.open(now);
    }

    /// Best-effort close. Pending operations are abandoned.
    pub fn close(&mut self, now: Instant) {
        let SessionStatus::Open(session_id) = self.status else {
            self.status = SessionStatus::Closed;
            return;
        };
        self.fail_all(ClientError::SessionClosed(session_id));
        self.status = SessionStatus::Closing;
        self.start(Purpose::Close { session_id }, now);
    }

    // =========================================================================
    // SUBMISSION
    // =========================================================================

    pub fn submit_command(&mut self, operation: Operation, consistency: CommandConsistency, now: Instant) -> OperationId {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.submit(
            Submission::Command {
                sequence,
                operation,
                consistency,
            },
            now,
        )
    }

    pub fn submit_query(&mut self, operation: Operation, consistency: QueryConsistency, now: Instant) -> OperationId {
        let sequence = self.next_sequence - 1;
        self.submit(
            Submission::Query {
                sequence,
                operation,
                consistency,
            },
            now,
        )
    }

    /// Encode and submit a typed command.
    pub fn command<C: CommandOp>(
        &mut self,
        command: &C,
        consistency: CommandConsistency,
        now: Instant,
    ) -> Result<OperationId, OperationError> {
        Ok(self.submit_command(Operation::command(command)?, consistency, now))
    }

    /// Encode and submit a typed query.
    pub fn query<Q: QueryOp>(
        &mut self,
        query: &Q,
        consistency: QueryConsistency,
        now: Instant,
    ) -> Result<OperationId, OperationError> {
        Ok(self.submit_query(Operation::query(query)?, consistency, now))
    }

    fn submit(&mut self, submission: Submission, now: Instant) -> OperationId {
        let id = self.next_operation_id;
        self.next_operation_id += 1;
        match self.status.clone() {
            SessionStatus::Open(_) => self.start(Purpose::User { id, submission }, now),
            SessionStatus::Failed(error) => {
                self.results.insert(id, Err(error));
            }
            SessionStatus::Closing | SessionStatus::Closed => {
                self.results.insert(id, Err(ClientError::Unavailable("client closed".into())));
            }
            SessionStatus::Unregistered | SessionStatus::Registering => {
                self.queued.push_back((id, submission));
            }
        }
        id
    }

    // =========================================================================
    // RESULTS
    // =========================================================================

    /// Remove and return a finished operation's result.
    pub fn take_result(&mut self, id: OperationId) -> Option<OperationOutput> {
        self.results.remove(&id)
    }

    /// Decode a finished operation's output.
    pub fn take_output<T: DeserializeOwned>(&mut self, id: OperationId) -> Option<Result<T, ClientError>> {
        let result = self.take_result(id)?;
        Some(result.and_then(|bytes| decode_output(&bytes).map_err(ClientError::Operation)))
    }

    pub fn is_done(&self, id: OperationId) -> bool {
        self.results.contains_key(&id)
    }

    /// Block until `id` finishes or `timeout` passes, driving the client
    /// on wall-clock time.
    pub fn wait_for(&mut self, id: OperationId, timeout: Duration) -> OperationOutput {
        let give_up = Instant::now() + timeout;
        loop {
            self.poll(Instant::now());
            if let Some(result) = self.results.remove(&id) {
                return result;
            }
            let now = Instant::now();
            if now >= give_up {
                return Err(ClientError::Timeout);
            }
            let slice = (give_up - now).min(Duration::from_millis(5));
            match self.endpoint.recv_timeout(slice) {
                Ok(Some(envelope)) => self.handle_envelope(envelope, Instant::now()),
                Ok(None) => {}
                Err(_) => return Err(ClientError::Unavailable("client endpoint disconnected".into())),
            }
        }
    }

    /// Block until the session opens or fails.
    pub fn wait_registered(&mut self, timeout: Duration) -> Result<SessionId, ClientError> {
        let give_up = Instant::now() + timeout;
        loop {
            self.poll(Instant::now());
            match &self.status {
                SessionStatus::Open(id) => return Ok(*id),
                SessionStatus::Failed(e) => return Err(e.clone()),
                _ => {}
            }
            let now = Instant::now();
            if now >= give_up {
                return Err(ClientError::Timeout);
            }
            if let Ok(Some(envelope)) = self.endpoint.recv_timeout((give_up - now).min(Duration::from_millis(5))) {
                self.handle_envelope(envelope, Instant::now());
            }
        }
    }

    // =========================================================================
    // DRIVING
    // =========================================================================

    /// Handle responses, retries, timeouts and keep-alives.
    pub fn poll(&mut self, now: Instant) {
        while let Some(envelope) = self.endpoint.try_recv() {
            self.handle_envelope(envelope, now);
        }

        let due: Vec<RequestId> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.retry_at.map_or(now >= o.deadline, |at| now >= at))
            .map(|(&id, _)| id)
            .collect();
        for request_id in due {
            let Some(mut o) = self.outstanding.remove(&request_id) else {
                continue;
            };
            if o.retry_at.take().is_some() {
                self.send(o, now);
                continue;
            }
            o.attempts += 1;
            if o.attempts >= self.config.max_attempts && !matches!(o.purpose, Purpose::Resend { .. }) {
                self.give_up(o.purpose, ClientError::Timeout, now);
                continue;
            }
            tracing::debug!(client_id = self.client_id, target = o.target, attempts = o.attempts, "request timed out, rotating");
            self.leader = None;
            o.target = self.next_member();
            self.send(o, now);
        }

        if let SessionStatus::Open(_) = self.status {
            let keep_alive_outstanding = self
                .outstanding
                .values()
                .any(|o| matches!(o.purpose, Purpose::KeepAlive { .. }));
            if !keep_alive_outstanding && now.saturating_duration_since(self.last_keep_alive) >= self.config.keep_alive_interval {
                self.last_keep_alive = now;
                let ack_sequence = self.acked;
                self.start(Purpose::KeepAlive { ack_sequence }, now);
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope, now: Instant) {
        match envelope.message {
            Message::Response(response) => self.handle_response(response, now),
            other => tracing::debug!(client_id = self.client_id, from = ?envelope.from, ?other, "unexpected message"),
        }
    }

    fn handle_response(&mut self, response: ClientResponse, now: Instant) {
        let Some(o) = self.outstanding.remove(&response.request_id) else {
            // Answer to an attempt that was already retried.
            return;
        };
        match response.result {
            Ok(reply) => self.complete(o.purpose, reply, now),
            Err(ClientError::NotLeader { leader_hint }) => {
                self.leader = leader_hint.filter(|id| self.members.contains(id));
                self.retry(o, now);
            }
            Err(error) if error.is_retryable() => {
                self.leader = None;
                self.retry(o, now);
            }
            Err(error) if error.is_session_error() => {
                self.session_failed(o.purpose, error);
            }
            Err(error) => self.finish_user(o.purpose, Err(error)),
        }
    }

    fn complete(&mut self, purpose: Purpose, reply: ClientReply, now: Instant) {
        match (purpose, reply) {
            (
                Purpose::Register,
                ClientReply::Registered {
                    session_id,
                    members,
                    leader,
                    ..
                },
            ) => {
                tracing::info!(client_id = self.client_id, session_id, "session open");
                self.update_membership(members, leader);
                self.status = SessionStatus::Open(session_id);
                self.last_keep_alive = now;
                while let Some((id, submission)) = self.queued.pop_front() {
                    self.start(Purpose::User { id, submission }, now);
                }
            }
            (Purpose::KeepAlive { ack_sequence }, ClientReply::KeptAlive { members, leader }) => {
                tracing::trace!(client_id = self.client_id, ack_sequence, "keep-alive acknowledged");
                self.update_membership(members, leader);
            }
            (Purpose::Close { session_id }, _) => {
                tracing::debug!(client_id = self.client_id, session_id, "session closed");
                self.status = SessionStatus::Closed;
            }
            (purpose @ (Purpose::User { .. } | Purpose::Resend { .. }), ClientReply::Output { index, output }) => {
                self.observed_index = self.observed_index.max(index);
                self.finish_user(purpose, Ok(output));
            }
            (purpose, reply) => {
                tracing::warn!(client_id = self.client_id, ?purpose, ?reply, "mismatched reply");
            }
        }
    }

    fn retry(&mut self, mut o: Outstanding, now: Instant) {
        o.attempts += 1;
        if o.attempts >= self.config.max_attempts && !matches!(o.purpose, Purpose::Resend { .. }) {
            self.give_up(o.purpose, ClientError::Unavailable("no leader reachable".into()), now);
            return;
        }
        o.target = self.target_for(&o.purpose);
        o.retry_at = Some(now + self.config.backoff(o.attempts));
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.outstanding.insert(request_id, o);
    }

    fn give_up(&mut self, purpose: Purpose, error: ClientError, now: Instant) {
        match purpose {
            Purpose::Register => {
                self.status = SessionStatus::Unregistered;
                self.fail_all(error);
            }
            Purpose::KeepAlive { .. } => {}
            Purpose::Close { .. } => self.status = SessionStatus::Closed,
            Purpose::User { id, submission } if submission.command_sequence().is_some() && self.session_id().is_some() => {
                // The command may still be applied. Its sequence stays in
                // use until the cluster answers for it.
                tracing::debug!(
                    client_id = self.client_id,
                    sequence = submission.command_sequence(),
                    %error,
                    "command unanswered, resending in the background"
                );
                self.results.insert(id, Err(error));
                let o = Outstanding {
                    purpose: Purpose::Resend { submission },
                    attempts: 0,
                    target: self.next_member(),
                    deadline: now,
                    retry_at: Some(now + self.config.backoff(0)),
                };
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                self.outstanding.insert(request_id, o);
            }
            purpose @ (Purpose::User { .. } | Purpose::Resend { .. }) => self.finish_user(purpose, Err(error)),
        }
    }

    fn session_failed(&mut self, purpose: Purpose, error: ClientError) {
        if let Purpose::Close { .. } = purpose {
            self.status = SessionStatus::Closed;
            return;
        }
        tracing::warn!(client_id = self.client_id, %error, "session lost");
        self.finish_user(purpose, Err(error.clone()));
        self.fail_all(error.clone());
        self.status = SessionStatus::Failed(error);
    }

    /// Fail every user operation that has not finished.
    fn fail_all(&mut self, error: ClientError) {
        let ids: Vec<RequestId> = self
            .outstanding
            .iter()
            .filter(|(_, o)| matches!(o.purpose, Purpose::User { .. } | Purpose::Resend { .. }))
            .map(|(&id, _)| id)
            .collect();
        for request_id in ids {
            if let Some(o) = self.outstanding.remove(&request_id) {
                self.finish_user(o.purpose, Err(error.clone()));
            }
        }
        for (id, _) in std::mem::take(&mut self.queued) {
            self.results.insert(id, Err(error.clone()));
        }
    }

    fn finish_user(&mut self, purpose: Purpose, result: OperationOutput) {
        let (id, sequence) = match &purpose {
            Purpose::User { id, submission } => (Some(*id), submission.command_sequence()),
            Purpose::Resend { submission } => (None, submission.command_sequence()),
            _ => return,
        };
        if let Some(sequence) = sequence {
            self.completed.insert(sequence);
            while self.completed.remove(&(self.acked + 1)) {
                self.acked += 1;
            }
        }
        if let Some(id) = id {
            self.results.insert(id, result);
        }
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    fn start(&mut self, purpose: Purpose, now: Instant) {
        let target = self.target_for(&purpose);
        let o = Outstanding {
            purpose,
            attempts: 0,
            target,
            deadline: now,
            retry_at: None,
        };
        self.send(o, now);
    }

    fn send(&mut self, mut o: Outstanding, now: Instant) {
        let Some(kind) = self.request_kind(&o.purpose) else {
            self.finish_user(o.purpose, Err(ClientError::Unavailable("no open session".into())));
            return;
        };
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        o.deadline = now + self.config.request_timeout;
        o.retry_at = None;
        self.endpoint.send(
            Address::Node(o.target),
            Message::Request(ClientRequest { request_id, kind }),
        );
        self.outstanding.insert(request_id, o);
    }

    fn request_kind(&self, purpose: &Purpose) -> Option<RequestKind> {
        let session_id = match self.status {
            SessionStatus::Open(id) => Some(id),
            _ => None,
        };
        Some(match purpose {
            Purpose::Register => RequestKind::Register {
                client_id: self.client_id,
                timeout_ms: self.config.session_timeout.as_millis() as u64,
            },
            Purpose::KeepAlive { ack_sequence } => RequestKind::KeepAlive {
                session_id: session_id?,
                ack_sequence: *ack_sequence,
            },
            Purpose::Close { session_id } => RequestKind::Close { session_id: *session_id },
            Purpose::User { submission, .. } | Purpose::Resend { submission } => match submission.clone() {
                Submission::Command {
                    sequence,
                    operation,
                    consistency,
                } => RequestKind::Command {
                    session_id: session_id?,
                    sequence,
                    operation,
                    consistency,
                },
                Submission::Query {
                    sequence,
                    operation,
                    consistency,
                } => RequestKind::Query {
                    session_id: session_id?,
                    sequence,
                    index: self.observed_index,
                    operation,
                    consistency,
                },
            },
        })
    }

    fn target_for(&mut self, purpose: &Purpose) -> NodeId {
        if let Some(submission) = purpose.submission() {
            if self.config.read_from_followers && submission.follower_readable() {
                return self.next_member();
            }
        }
        match self.leader {
            Some(leader) => leader,
            None => self.next_member(),
        }
    }

    fn next_member(&mut self) -> NodeId {
        if self.members.is_empty() {
            return 0;
        }
        self.cursor = (self.cursor + 1) % self.members.len();
        self.members[self.cursor]
    }

    fn update_membership(&mut self, members: Vec<NodeId>, leader: Option<NodeId>) {
        if !members.is_empty() && members != self.members {
            tracing::info!(client_id = self.client_id, ?members, "member list updated");
            self.members = members;
            self.cursor = 0;
        }
        if leader.is_some() {
            self.leader = leader;
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self.status {
            SessionStatus::Open(id) => Some(id),
            _ => None,
        }
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn observed_index(&self) -> LogIndex {
        self.observed_index
    }

    /// Highest command sequence with every predecessor finished.
    pub fn acked_sequence(&self) -> u64 {
        self.acked
    }

    /// Requests sent or backing off.
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    pub fn address(&self) -> Address {
        self.endpoint.address()
    }
}

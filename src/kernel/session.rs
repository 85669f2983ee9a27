//! Client sessions: the state behind exactly-once command application.
//!
//! Every mutation here is driven by an applied log entry, so all nodes hold
//! identical session tables at the same applied index. Time is log time
//! (the leader-assigned entry timestamp), never the local clock.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::LogIndex;
use crate::kernel::traits::OperationResult;

pub type SessionId = u64;
pub type ClientId = u64;

/// Cached results kept per session before the oldest are dropped, even if
/// the client never acknowledges them.
pub const MAX_CACHED_RESULTS: usize = 1024;

/// Ended sessions remembered so that late requests get a precise error.
pub const MAX_ENDED_SESSIONS: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Expired,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SessionError {
    #[error("unknown session {0}")]
    Unknown(SessionId),
    #[error("session {0} expired")]
    Expired(SessionId),
    #[error("session {0} was closed")]
    Closed(SessionId),
}

/// Payload of a REGISTER entry. The timeout is already clamped by the leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub client_id: ClientId,
    pub timeout_ns: u64,
}

/// Result of a command as first computed, replayed for retransmissions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResult {
    pub index: LogIndex,
    pub result: OperationResult,
}

/// Verdict for an incoming command sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Not applied yet.
    Apply,
    /// Already applied; here is the result it produced.
    Duplicate(CachedResult),
    /// Already applied and the result was released.
    Stale,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub client_id: ClientId,
    pub timeout_ns: u64,
    pub last_keep_alive_ns: u64,
    /// Highest command sequence applied.
    pub last_applied_sequence: u64,
    /// Highest sequence whose result the client confirmed receiving.
    pub acked_sequence: u64,
    /// Index of the last command applied for this session.
    pub last_write_index: LogIndex,
    results: BTreeMap<u64, CachedResult>,
}

impl Session {
    fn new(id: SessionId, client_id: ClientId, timeout_ns: u64, now_ns: u64) -> Self {
        Session {
            id,
            client_id,
            timeout_ns,
            last_keep_alive_ns: now_ns,
            last_applied_sequence: 0,
            acked_sequence: 0,
            last_write_index: id,
            results: BTreeMap::new(),
        }
    }

    pub fn cached_results(&self) -> usize {
        self.results.len()
    }

    pub fn cached(&self, sequence: u64) -> Option<&CachedResult> {
        self.results.get(&sequence)
    }
}

/// Table of open sessions plus a bounded memory of ended ones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionManager {
    open: BTreeMap<SessionId, Session>,
    ended: BTreeMap<SessionId, SessionState>,
    by_client: BTreeMap<ClientId, SessionId>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session whose id is the registration entry's index.
    ///
    /// A client holds at most one live session: an older session for the
    /// same client is closed and its id returned.
    pub fn register(
        &mut self,
        index: LogIndex,
        client_id: ClientId,
        timeout_ns: u64,
        now_ns: u64,
    ) -> Option<SessionId> {
        let superseded = self.by_client.insert(client_id, index);
        if let Some(old) = superseded {
            self.end(old, SessionState::Closed);
        }
        self.open.insert(index, Session::new(index, client_id, timeout_ns, now_ns));
        superseded
    }

    /// Refresh a session and release cached results up to `ack_sequence`.
    pub fn keep_alive(
        &mut self,
        id: SessionId,
        ack_sequence: u64,
        now_ns: u64,
    ) -> Result<(), SessionError> {
        let session = self.get_mut(id)?;
        session.last_keep_alive_ns = session.last_keep_alive_ns.max(now_ns);
        if ack_sequence > session.acked_sequence {
            session.acked_sequence = ack_sequence.min(session.last_applied_sequence);
            let keep = session.results.split_off(&(session.acked_sequence + 1));
            session.results = keep;
        }
        Ok(())
    }

    pub fn close(&mut self, id: SessionId) -> Result<(), SessionError> {
        self.get(id)?;
        self.end(id, SessionState::Closed);
        Ok(())
    }

    pub fn expire(&mut self, id: SessionId) -> Result<(), SessionError> {
        self.get(id)?;
        self.end(id, SessionState::Expired);
        Ok(())
    }

    fn end(&mut self, id: SessionId, state: SessionState) {
        if let Some(session) = self.open.remove(&id) {
            if self.by_client.get(&session.client_id) == Some(&id) {
                self.by_client.remove(&session.client_id);
            }
        }
        self.ended.insert(id, state);
        while self.ended.len() > MAX_ENDED_SESSIONS {
            self.ended.pop_first();
        }
    }

    /// The open session `id`, or the reason it is not usable.
    pub fn get(&self, id: SessionId) -> Result<&Session, SessionError> {
        match self.open.get(&id) {
            Some(session) => Ok(session),
            None => Err(self.missing(id)),
        }
    }

    fn get_mut(&mut self, id: SessionId) -> Result<&mut Session, SessionError> {
        if !self.open.contains_key(&id) {
            return Err(self.missing(id));
        }
        self.open.get_mut(&id).ok_or(SessionError::Unknown(id))
    }

    fn missing(&self, id: SessionId) -> SessionError {
        match self.ended.get(&id) {
            Some(SessionState::Expired) => SessionError::Expired(id),
            Some(SessionState::Closed) => SessionError::Closed(id),
            _ => SessionError::Unknown(id),
        }
    }

    pub fn check_sequence(&self, id: SessionId, sequence: u64) -> Result<SequenceCheck, SessionError> {
        let session = self.get(id)?;
        if sequence > session.last_applied_sequence {
            return Ok(SequenceCheck::Apply);
        }
        Ok(match session.results.get(&sequence) {
            Some(cached) => SequenceCheck::Duplicate(cached.clone()),
            None => SequenceCheck::Stale,
        })
    }

    /// Record the outcome of a freshly applied command.
    pub fn record_result(
        &mut self,
        id: SessionId,
        sequence: u64,
        index: LogIndex,
        result: OperationResult,
    ) -> Result<(), SessionError> {
        let session = self.get_mut(id)?;
        session.last_applied_sequence = session.last_applied_sequence.max(sequence);
        session.last_write_index = index;
        session.results.insert(sequence, CachedResult { index, result });
        while session.results.len() > MAX_CACHED_RESULTS {
            session.results.pop_first();
        }
        Ok(())
    }

    /// Open sessions idle past their timeout at log time `now_ns`.
    ///
    /// Idle time is measured from the later of the last keep-alive and
    /// `floor_ns`, the moment the current leader took over.
    pub fn expired_sessions(&self, now_ns: u64, floor_ns: u64) -> Vec<SessionId> {
        self.open
            .values()
            .filter(|s| now_ns.saturating_sub(s.last_keep_alive_ns.max(floor_ns)) > s.timeout_ns)
            .map(|s| s.id)
            .collect()
    }

    pub fn session_for_client(&self, client_id: ClientId) -> Option<SessionId> {
        self.by_client.get(&client_id).copied()
    }

    pub fn open_sessions(&self) -> impl Iterator<Item = &Session> {
        self.open.values()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: u64 = 1_000_000_000;

    #[test]
    fn test_register_assigns_index_as_id() {
        let mut sessions = SessionManager::new();
        assert_eq!(sessions.register(7, 100, 5 * SECOND, 0), None);
        let session = sessions.get(7).unwrap();
        assert_eq!(session.client_id, 100);
        assert_eq!(sessions.session_for_client(100), Some(7));
    }

    #[test]
    fn test_reregistration_supersedes_old_session() {
        let mut sessions = SessionManager::new();
        sessions.register(3, 100, SECOND, 0);
        assert_eq!(sessions.register(9, 100, SECOND, 0), Some(3));

        assert_eq!(sessions.get(3).unwrap_err(), SessionError::Closed(3));
        assert!(sessions.get(9).is_ok());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_duplicate_sequence_returns_cached_result() {
        let mut sessions = SessionManager::new();
        sessions.register(1, 100, SECOND, 0);
        assert_eq!(sessions.check_sequence(1, 1).unwrap(), SequenceCheck::Apply);

        sessions.record_result(1, 1, 2, Ok(b"first".to_vec())).unwrap();
        match sessions.check_sequence(1, 1).unwrap() {
            SequenceCheck::Duplicate(cached) => {
                assert_eq!(cached.index, 2);
                assert_eq!(cached.result, Ok(b"first".to_vec()));
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(sessions.check_sequence(1, 2).unwrap(), SequenceCheck::Apply);
    }

    #[test]
    fn test_keep_alive_releases_acknowledged_results() {
        let mut sessions = SessionManager::new();
        sessions.register(1, 100, SECOND, 0);
        for seq in 1..=3 {
            sessions.record_result(1, seq, 1 + seq, Ok(vec![seq as u8])).unwrap();
        }

        sessions.keep_alive(1, 2, 10).unwrap();
        assert_eq!(sessions.get(1).unwrap().cached_results(), 1);
        assert_eq!(sessions.check_sequence(1, 2).unwrap(), SequenceCheck::Stale);
        assert!(matches!(sessions.check_sequence(1, 3).unwrap(), SequenceCheck::Duplicate(_)));
        assert_eq!(sessions.get(1).unwrap().last_keep_alive_ns, 10);
    }

    #[test]
    fn test_expiration_uses_log_time_and_leader_floor() {
        let mut sessions = SessionManager::new();
        sessions.register(1, 100, 5 * SECOND, 0);
        sessions.register(2, 200, 5 * SECOND, 0);
        sessions.keep_alive(2, 0, 4 * SECOND).unwrap();

        assert!(sessions.expired_sessions(5 * SECOND, 0).is_empty());
        assert_eq!(sessions.expired_sessions(6 * SECOND, 0), vec![1]);
        // A new leader that took over at 3s gives everyone a fresh window.
        assert!(sessions.expired_sessions(6 * SECOND, 3 * SECOND).is_empty());
    }

    #[test]
    fn test_expired_and_closed_are_distinct() {
        let mut sessions = SessionManager::new();
        sessions.register(1, 100, SECOND, 0);
        sessions.register(2, 200, SECOND, 0);
        sessions.expire(1).unwrap();
        sessions.close(2).unwrap();

        assert_eq!(sessions.check_sequence(1, 1).unwrap_err(), SessionError::Expired(1));
        assert_eq!(sessions.keep_alive(2, 0, 0).unwrap_err(), SessionError::Closed(2));
        assert_eq!(sessions.get(99).unwrap_err(), SessionError::Unknown(99));
        assert_eq!(sessions.expire(1).unwrap_err(), SessionError::Expired(1));
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_result_cache_is_bounded() {
        let mut sessions = SessionManager::new();
        sessions.register(1, 100, SECOND, 0);
        for seq in 1..=(MAX_CACHED_RESULTS as u64 + 10) {
            sessions.record_result(1, seq, seq + 1, Ok(Vec::new())).unwrap();
        }
        assert_eq!(sessions.get(1).unwrap().cached_results(), MAX_CACHED_RESULTS);
        assert_eq!(sessions.check_sequence(1, 1).unwrap(), SequenceCheck::Stale);
    }
}

//! Safety checker.
//!
//! Watches every node after each delivery round and verifies:
//! - Election Safety: at most one leader per term
//! - Log Matching: entries with the same index and term are identical
//! - Commit Durability: a committed index never changes content
//! - Leader Append-Only: a leader never rewrites its own log in its term
//!
//! A client-side `History` of counter increments verifies exactly-once
//! application against the final state.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::engine::{LogEntry, LogIndex, NodeId, Term};
use crate::kernel::traits::StateMachine;
use crate::raft::node::{NodeRole, RaftNode};

type Digest = [u8; 32];

fn digest(entry: &LogEntry) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&entry.index.to_le_bytes());
    hasher.update(&entry.term.to_le_bytes());
    hasher.update(&[entry.kind as u8]);
    hasher.update(&entry.session_id.to_le_bytes());
    hasher.update(&entry.sequence.to_le_bytes());
    hasher.update(&entry.timestamp_ns.to_le_bytes());
    hasher.update(&entry.payload);
    *hasher.finalize().as_bytes()
}

/// A safety violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// Two nodes led the same term.
    TwoLeaders,
    /// Same (index, term), different content.
    LogMismatch,
    /// A committed index changed content.
    CommitLost,
    /// A leader truncated or rewrote an entry from its own term.
    LeaderRewrite,
    /// A counter disagrees with the acknowledged increments.
    CounterMismatch,
}

#[derive(Debug, Default)]
struct NodeView {
    /// Everything at or below this index has been checked as committed.
    committed_through: LogIndex,
}

#[derive(Debug, Default)]
pub struct ClusterChecker {
    leaders: HashMap<Term, NodeId>,
    entries: HashMap<(LogIndex, Term), Digest>,
    committed: BTreeMap<LogIndex, Digest>,
    /// (node, term) -> last (index, digest) seen while that node led that term.
    leader_tails: HashMap<(NodeId, Term), (LogIndex, Digest)>,
    views: HashMap<NodeId, NodeView>,
    violations: Vec<Violation>,
    reported: HashSet<(ViolationKind, LogIndex, Term)>,
}

impl ClusterChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check one node's current state against everything seen so far.
    pub fn observe<S: StateMachine>(&mut self, node: &RaftNode<S>) {
        let id = node.id();
        let term = node.current_term();
        let log = node.log();

        if node.role() == NodeRole::Leader {
            match self.leaders.get(&term) {
                Some(&other) if other != id => self.report(
                    ViolationKind::TwoLeaders,
                    0,
                    term,
                    format!("nodes {other} and {id} both led term {term}"),
                ),
                Some(_) => {}
                None => {
                    self.leaders.insert(term, id);
                }
            }

            if let Some(&(index, expected)) = self.leader_tails.get(&(id, term)) {
                let still_there = index <= log.base_index()
                    || log.get(index).map(|e| digest(e) == expected).unwrap_or(false);
                if !still_there {
                    self.report(
                        ViolationKind::LeaderRewrite,
                        index,
                        term,
                        format!("leader {id} lost its own entry {index} in term {term}"),
                    );
                }
            }
            if let Ok(last) = log.get(log.last_index()) {
                self.leader_tails.insert((id, term), (last.index, digest(last)));
            }
        }

        let committed_through = self.views.entry(id).or_default().committed_through;
        let first = committed_through.max(log.base_index()) + 1;
        let commit = node.commit_index();
        for index in first..=log.last_index() {
            let Ok(entry) = log.get(index) else {
                continue;
            };
            let hash = digest(entry);

            match self.entries.get(&(index, entry.term)) {
                Some(&known) if known != hash => self.report(
                    ViolationKind::LogMismatch,
                    index,
                    entry.term,
                    format!("node {id} has different content at index {index} term {}", entry.term),
                ),
                Some(_) => {}
                None => {
                    self.entries.insert((index, entry.term), hash);
                }
            }

            if index <= commit {
                match self.committed.get(&index) {
                    Some(&known) if known != hash => self.report(
                        ViolationKind::CommitLost,
                        index,
                        entry.term,
                        format!("node {id} committed different content at index {index}"),
                    ),
                    Some(_) => {}
                    None => {
                        self.committed.insert(index, hash);
                    }
                }
            }
        }

        let view = self.views.entry(id).or_default();
        view.committed_through = view.committed_through.max(commit.min(log.last_index()));
    }

    fn report(&mut self, kind: ViolationKind, index: LogIndex, term: Term, description: String) {
        if self.reported.insert((kind, index, term)) {
            tracing::error!(?kind, index, term, %description, "safety violation");
            self.violations.push(Violation { kind, description });
        }
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Highest index any node has been seen committing.
    pub fn max_committed(&self) -> LogIndex {
        self.committed.keys().next_back().copied().unwrap_or(0)
    }

    pub fn leader_of(&self, term: Term) -> Option<NodeId> {
        self.leaders.get(&term).copied()
    }
}

// =============================================================================
// CLIENT HISTORY
// =============================================================================

/// How a recorded increment ended, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledged: applied exactly once.
    Acked,
    /// Failed with an error that may or may not have applied.
    Indeterminate,
    /// Rejected before it could apply.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub client_id: u64,
    pub key: String,
    pub by: u64,
    pub outcome: Outcome,
}

/// Increments issued by clients during a run.
#[derive(Debug, Default)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

/// Result of comparing a history with the final counters.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub stats: CheckStats,
}

#[derive(Debug, Clone, Default)]
pub struct CheckStats {
    pub acked: usize,
    pub indeterminate: usize,
    pub rejected: usize,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, client_id: u64, key: &str, by: u64, outcome: Outcome) {
        self.entries.push(HistoryEntry {
            client_id,
            key: key.to_string(),
            by,
            outcome,
        });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every counter must hold at least its acknowledged increments and at
    /// most those plus the indeterminate ones.
    pub fn verify<F>(&self, counter: F) -> CheckResult
    where
        F: Fn(&str) -> u64,
    {
        let mut stats = CheckStats::default();
        let mut bounds: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for entry in &self.entries {
            let (low, high) = bounds.entry(entry.key.as_str()).or_default();
            match entry.outcome {
                Outcome::Acked => {
                    stats.acked += 1;
                    *low += entry.by;
                    *high += entry.by;
                }
                Outcome::Indeterminate => {
                    stats.indeterminate += 1;
                    *high += entry.by;
                }
                Outcome::Rejected => stats.rejected += 1,
            }
        }

        let violations: Vec<Violation> = bounds
            .into_iter()
            .filter_map(|(key, (low, high))| {
                let actual = counter(key);
                (actual < low || actual > high).then(|| Violation {
                    kind: ViolationKind::CounterMismatch,
                    description: format!("counter {key} = {actual}, expected {low}..={high}"),
                })
            })
            .collect();

        CheckResult {
            passed: violations.is_empty(),
            violations,
            stats,
        }
    }
}

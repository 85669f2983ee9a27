//! Majority arithmetic: vote counting, commit index and heartbeat rounds.
//!
//! Uses a fixed-size bitset instead of HashSet for vote tracking.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::engine::{LogIndex, NodeId};

/// Maximum supported node id + 1.
/// Using u64 bitset allows tracking up to 64 nodes efficiently.
pub const MAX_CLUSTER_SIZE: u32 = 64;

/// Rounds whose start time is remembered.
const ROUND_HISTORY: usize = 1024;

/// A compact bitset for tracking node acknowledgments.
///
/// Bit N is set if node N has acknowledged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeBitset(u64);

impl NodeBitset {
    #[inline]
    pub fn new() -> Self {
        NodeBitset(0)
    }

    /// Set the bit for a node ID. Ids beyond the bitset are ignored.
    #[inline]
    pub fn insert(&mut self, node_id: NodeId) {
        if node_id < MAX_CLUSTER_SIZE {
            self.0 |= 1u64 << node_id;
        }
    }

    #[inline]
    pub fn contains(&self, node_id: NodeId) -> bool {
        node_id < MAX_CLUSTER_SIZE && (self.0 & (1u64 << node_id)) != 0
    }

    /// Number of `members` whose bit is set.
    pub fn count_in(&self, members: &[NodeId]) -> usize {
        members.iter().filter(|&&id| self.contains(id)).count()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Strict majority of `n` members.
#[inline]
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Highest index stored on a majority of `members`.
///
/// `local` is this node's last durable index; peers missing from
/// `match_index` count as 0.
pub fn quorum_match_index(
    members: &[NodeId],
    local_id: NodeId,
    local: LogIndex,
    match_index: &HashMap<NodeId, LogIndex>,
) -> LogIndex {
    if members.is_empty() {
        return 0;
    }
    let mut matched: Vec<LogIndex> = members
        .iter()
        .map(|id| {
            if *id == local_id {
                local
            } else {
                match_index.get(id).copied().unwrap_or(0)
            }
        })
        .collect();
    matched.sort_unstable_by(|a, b| b.cmp(a));
    matched[majority(matched.len()) - 1]
}

/// Leader-side heartbeat rounds.
///
/// Every broadcast starts a new round. A round acknowledged by a majority
/// (the leader counts for every round) proves this node was leader when
/// the round started, which is what read-index and leases need.
#[derive(Debug, Default)]
pub struct RoundTracker {
    current: u64,
    started_at: BTreeMap<u64, Instant>,
    acked: HashMap<NodeId, u64>,
}

impl RoundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything. Called when leadership starts.
    pub fn reset(&mut self) {
        self.current = 0;
        self.started_at.clear();
        self.acked.clear();
    }

    pub fn start_round(&mut self, now: Instant) -> u64 {
        self.current += 1;
        self.started_at.insert(self.current, now);
        while self.started_at.len() > ROUND_HISTORY {
            self.started_at.pop_first();
        }
        self.current
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Record that `node` answered a message of `round` in the current term.
    pub fn ack(&mut self, node: NodeId, round: u64) {
        if round > self.current {
            return;
        }
        let acked = self.acked.entry(node).or_insert(0);
        *acked = (*acked).max(round);
    }

    /// Highest round acknowledged by a majority of `members`.
    pub fn quorum_round(&self, members: &[NodeId], local_id: NodeId) -> u64 {
        if members.is_empty() {
            return 0;
        }
        let mut rounds: Vec<u64> = members
            .iter()
            .map(|id| {
                if *id == local_id {
                    self.current
                } else {
                    self.acked.get(id).copied().unwrap_or(0)
                }
            })
            .collect();
        rounds.sort_unstable_by(|a, b| b.cmp(a));
        rounds[majority(rounds.len()) - 1]
    }

    /// When the highest majority-acknowledged round started.
    pub fn quorum_round_start(&self, members: &[NodeId], local_id: NodeId) -> Option<Instant> {
        match self.quorum_round(members, local_id) {
            0 => None,
            round => self.started_at.get(&round).copied(),
        }
    }
}

//! Cluster-level tests: elections, replication, sessions and every
//! consistency level, on the simulated cluster and on real threads.

use std::thread;
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};

use crate::chaos::SimCluster;
use crate::config::{ClientConfig, NodeConfig, ReadMode};
use crate::engine::fault_injection::FaultInjector;
use crate::engine::{EntryKind, LogEntry, LogIndex, NodeId, Term};
use crate::kernel::kv::{Echo, EchoQuery, Get, Increment, KvStore, Put, ReadCounter};
use crate::kernel::session::ClientId;
use crate::kernel::traits::{decode_output, CommandOp, Operation, QueryOp};
use crate::raft::client::{ClusterClient, SessionStatus};
use crate::raft::error::{ClientError, RaftError};
use crate::raft::message::{
    Address, ClientRequest, CommandConsistency, Message, QueryConsistency, RaftMessage, RequestKind,
};
use crate::raft::network::{Endpoint, MockNetwork};
use crate::raft::node::{NodeRole, RaftNode, META_FILE_NAME};
use crate::raft::server::ServerHandle;
use crate::telemetry::init_test_tracing;

const WAIT: Duration = Duration::from_secs(10);

fn start(size: u32, config: NodeConfig) -> (TempDir, SimCluster) {
    init_test_tracing();
    let dir = tempdir().unwrap();
    let mut cluster = SimCluster::new(dir.path(), size, config).unwrap();
    cluster.wait_for_leader(WAIT).expect("no leader elected");
    (dir, cluster)
}

fn seeded(seed: u64) -> NodeConfig {
    NodeConfig {
        election_seed: Some(seed),
        ..NodeConfig::default()
    }
}

fn connect(cluster: &mut SimCluster, client_id: ClientId, config: ClientConfig) -> ClientId {
    cluster.add_client(client_id, config).unwrap();
    assert!(cluster.wait_registered(client_id, WAIT), "client {client_id} never registered");
    client_id
}

fn command<C: CommandOp>(
    cluster: &mut SimCluster,
    client: ClientId,
    op: &C,
    consistency: CommandConsistency,
) -> Result<C::Output, ClientError> {
    let now = cluster.now();
    let id = cluster.client(client).unwrap().command(op, consistency, now).unwrap();
    let output = cluster.run_until_done(client, id, WAIT).expect("command never finished")?;
    Ok(decode_output(&output).unwrap())
}

fn query<Q: QueryOp>(
    cluster: &mut SimCluster,
    client: ClientId,
    op: &Q,
    consistency: QueryConsistency,
) -> Result<Q::Output, ClientError> {
    let now = cluster.now();
    let id = cluster.client(client).unwrap().query(op, consistency, now).unwrap();
    let output = cluster.run_until_done(client, id, WAIT).expect("query never finished")?;
    Ok(decode_output(&output).unwrap())
}

fn command_entries(cluster: &SimCluster, id: NodeId) -> usize {
    let log = cluster.node(id).unwrap().log();
    log.iter_range(0, log.last_index())
        .filter(|e| e.kind == EntryKind::Command)
        .count()
}

// =============================================================================
// ELECTION AND REPLICATION
// =============================================================================

#[test]
fn test_single_leader_elected() {
    let (_dir, mut cluster) = start(3, seeded(1));
    cluster.run_for(Duration::from_secs(1));

    let leaders: Vec<_> = cluster.live_nodes().filter(|n| n.is_leader()).collect();
    assert_eq!(leaders.len(), 1);
    let leader = leaders[0];
    for node in cluster.live_nodes() {
        assert_eq!(node.current_term(), leader.current_term());
        assert_eq!(node.leader_id(), Some(leader.id()));
    }
    // The leader's no-op is committed everywhere.
    assert!(cluster.live_nodes().all(|n| n.commit_index() >= 1));
    assert!(cluster.checker().is_clean());
}

#[test]
fn test_linearizable_echo_on_five_nodes() {
    let (_dir, mut cluster) = start(5, seeded(2));
    let client = connect(&mut cluster, 1, ClientConfig::default());

    let output = command(&mut cluster, client, &Echo("Hello world!".into()), CommandConsistency::Linearizable);
    assert_eq!(output.unwrap(), "Hello world!");

    cluster.run_for(Duration::from_millis(500));
    for &id in cluster.members() {
        assert_eq!(command_entries(&cluster, id), 1, "node {id}");
    }
    assert!(cluster.checker().is_clean());
}

#[test]
fn test_exactly_once_across_leader_change() {
    let (_dir, mut cluster) = start(3, seeded(3));
    let config = ClientConfig {
        request_timeout: Duration::from_millis(300),
        max_attempts: 50,
        ..ClientConfig::default()
    };
    let client = connect(&mut cluster, 1, config);
    let inc = |by| Increment { key: "c".into(), by };

    assert_eq!(command(&mut cluster, client, &inc(1), CommandConsistency::Linearizable).unwrap(), 1);

    // The leader applies the next increment but its answer is lost.
    let old = cluster.leader().unwrap();
    cluster.network().block(Address::Node(old), Address::Client(client));
    let now = cluster.now();
    let id = cluster
        .client(client)
        .unwrap()
        .command(&inc(10), CommandConsistency::Linearizable, now)
        .unwrap();
    assert!(cluster.run_until(WAIT, |c| c.node(old).unwrap().executor().machine().counter("c") == 11));

    // Depose it; the retry reaches the next leader and hits the session cache.
    cluster.isolate(old);
    let output = cluster.run_until_done(client, id, Duration::from_secs(30)).unwrap().unwrap();
    assert_eq!(decode_output::<u64>(&output).unwrap(), 11);
    assert_ne!(cluster.leader(), Some(old));

    cluster.heal();
    assert!(cluster.run_until(WAIT, |c| {
        c.leader().is_some() && c.live_nodes().all(|n| n.executor().machine().counter("c") == 11)
    }));
    let leader = cluster.leader().unwrap();
    assert_eq!(command_entries(&cluster, leader), 2);
    assert!(cluster.checker().is_clean());
}

#[test]
fn test_minority_partition_cannot_commit() {
    let (_dir, mut cluster) = start(5, seeded(4));
    let leader = cluster.leader().unwrap();
    let follower = cluster.members().iter().copied().find(|&id| id != leader).unwrap();
    cluster.partition(&[leader, follower]);

    let before = cluster.node(leader).unwrap().commit_index();
    assert!(cluster.run_until(WAIT, |c| c.leader().is_some_and(|id| id != leader && id != follower)));
    // The old leader steps down once it has gone a full election timeout
    // without a majority.
    assert!(cluster.run_until(WAIT, |c| !c.node(leader).unwrap().is_leader()));
    assert_eq!(cluster.node(leader).unwrap().commit_index(), before);

    cluster.heal();
    assert!(cluster.run_until(WAIT, |c| {
        let Some(id) = c.leader() else { return false };
        let commit = c.node(id).unwrap().commit_index();
        c.live_nodes().all(|n| n.commit_index() == commit)
    }));
    assert!(cluster.checker().is_clean());
}

// =============================================================================
// SESSIONS
// =============================================================================

#[test]
fn test_idle_session_expires() {
    let (_dir, mut cluster) = start(3, seeded(5));
    let config = ClientConfig {
        request_timeout: Duration::from_millis(200),
        keep_alive_interval: Duration::from_millis(100),
        session_timeout: Duration::from_millis(300),
        ..ClientConfig::default()
    };
    let client = connect(&mut cluster, 1, config);
    let session = cluster.client(client).unwrap().session_id().unwrap();

    // Silence the client well past its timeout.
    cluster.network().isolate(Address::Client(client));
    cluster.run_for(Duration::from_secs(1));
    let leader = cluster.leader().unwrap();
    let sessions = cluster.node(leader).unwrap().executor().sessions();
    assert!(sessions.get(session).is_err());
    assert!(cluster.node(leader).unwrap().executor().machine().closed_sessions().contains(&session));

    cluster.heal();
    assert!(cluster.run_until(WAIT, |c| matches!(
        c.client_status(client),
        Some(SessionStatus::Failed(ClientError::SessionExpired(_)))
    )));
    let result = command(&mut cluster, client, &Put { key: "k".into(), value: "v".into() }, CommandConsistency::Sequential);
    assert_eq!(result.unwrap_err(), ClientError::SessionExpired(session));

    // A fresh session works again.
    let now = cluster.now();
    cluster.client(client).unwrap().reset_session(now);
    assert!(cluster.wait_registered(client, WAIT));
    assert_ne!(cluster.client(client).unwrap().session_id(), Some(session));
}

#[test]
fn test_keep_alive_holds_session_open() {
    let (_dir, mut cluster) = start(3, seeded(6));
    let config = ClientConfig {
        keep_alive_interval: Duration::from_millis(100),
        session_timeout: Duration::from_millis(400),
        ..ClientConfig::default()
    };
    let client = connect(&mut cluster, 1, config);
    cluster.run_for(Duration::from_secs(3));

    let session = cluster.client(client).unwrap().session_id().unwrap();
    let leader = cluster.leader().unwrap();
    assert!(cluster.node(leader).unwrap().executor().sessions().get(session).is_ok());
    assert_eq!(command(&mut cluster, client, &Increment { key: "k".into(), by: 2 }, CommandConsistency::Linearizable).unwrap(), 2);
}

#[test]
fn test_close_ends_session() {
    let (_dir, mut cluster) = start(3, seeded(7));
    let client = connect(&mut cluster, 1, ClientConfig::default());
    let session = cluster.client(client).unwrap().session_id().unwrap();

    let now = cluster.now();
    cluster.client(client).unwrap().close(now);
    assert!(cluster.run_until(WAIT, |c| c.client_status(client) == Some(SessionStatus::Closed)));
    cluster.run_for(Duration::from_millis(200));
    for node in cluster.live_nodes() {
        assert!(node.executor().sessions().get(session).is_err());
        assert!(node.executor().machine().closed_sessions().contains(&session));
    }
}

#[test]
fn test_unanswered_command_does_not_stall_session() {
    let (_dir, mut cluster) = start(3, seeded(20));
    let config = ClientConfig {
        request_timeout: Duration::from_millis(200),
        max_attempts: 3,
        ..ClientConfig::default()
    };
    let client = connect(&mut cluster, 1, config);
    let inc = Increment { key: "n".into(), by: 1 };

    cluster.network().isolate(Address::Client(client));
    let lost = command(&mut cluster, client, &inc, CommandConsistency::Linearizable);
    assert_eq!(lost.unwrap_err(), ClientError::Timeout);
    cluster.heal();
    assert!(matches!(cluster.client_status(client), Some(SessionStatus::Open(_))));

    // The abandoned increment still lands, ahead of the next one.
    assert_eq!(command(&mut cluster, client, &inc, CommandConsistency::Linearizable).unwrap(), 2);
    let total = query(&mut cluster, client, &ReadCounter { key: "n".into() }, QueryConsistency::Linearizable);
    assert_eq!(total.unwrap(), 2);
    assert_eq!(cluster.client(client).unwrap().acked_sequence(), 2);

    let leader = cluster.leader().unwrap();
    assert_eq!(command_entries(&cluster, leader), 2);
}

// =============================================================================
// CONSISTENCY
// =============================================================================

#[test]
fn test_bounded_linearizable_read_after_write() {
    let (_dir, mut cluster) = start(3, seeded(8));
    let client = connect(&mut cluster, 1, ClientConfig::default());

    command(&mut cluster, client, &Put { key: "k".into(), value: "v1".into() }, CommandConsistency::Sequential).unwrap();
    let value = query(&mut cluster, client, &Get { key: "k".into() }, QueryConsistency::BoundedLinearizable);
    assert_eq!(value.unwrap().as_deref(), Some("v1"));
}

fn check_every_query_level(read_mode: ReadMode, seed: u64) {
    let config = NodeConfig {
        read_mode,
        ..seeded(seed)
    };
    let (_dir, mut cluster) = start(3, config);
    let leader_reader = connect(&mut cluster, 1, ClientConfig::default());
    let follower_reader = connect(
        &mut cluster,
        2,
        ClientConfig {
            read_from_followers: true,
            ..ClientConfig::default()
        },
    );

    let levels = [
        QueryConsistency::Causal,
        QueryConsistency::Sequential,
        QueryConsistency::BoundedLinearizable,
        QueryConsistency::Linearizable,
    ];
    for (round, level) in levels.into_iter().enumerate() {
        for client in [leader_reader, follower_reader] {
            let value = format!("{level:?}-{client}-{round}");
            let put = Put {
                key: format!("k{client}"),
                value: value.clone(),
            };
            command(&mut cluster, client, &put, CommandConsistency::Linearizable).unwrap();
            let got = query(&mut cluster, client, &Get { key: format!("k{client}") }, level).unwrap();
            assert_eq!(got, Some(value), "{read_mode:?} {level:?} client {client}");
        }
    }
    assert!(cluster.checker().is_clean());
}

#[test]
fn test_every_query_level_reads_own_writes_read_index() {
    check_every_query_level(ReadMode::ReadIndex, 9);
}

#[test]
fn test_every_query_level_reads_own_writes_log_marker() {
    check_every_query_level(ReadMode::LogMarker, 10);
}

#[test]
fn test_log_marker_reads_append_markers() {
    let config = NodeConfig {
        read_mode: ReadMode::LogMarker,
        ..seeded(11)
    };
    let (_dir, mut cluster) = start(3, config);
    let client = connect(&mut cluster, 1, ClientConfig::default());
    let value = query(&mut cluster, client, &ReadCounter { key: "x".into() }, QueryConsistency::Linearizable);
    assert_eq!(value.unwrap(), 0);

    let leader = cluster.leader().unwrap();
    let log = cluster.node(leader).unwrap().log();
    let markers = log
        .iter_range(0, log.last_index())
        .filter(|e| e.kind == EntryKind::QueryMarker)
        .count();
    assert_eq!(markers, 1);
}

#[test]
fn test_every_command_and_query_level_echoes() {
    let (_dir, mut cluster) = start(5, seeded(12));
    let client = connect(&mut cluster, 1, ClientConfig::default());

    for level in [CommandConsistency::None, CommandConsistency::Sequential, CommandConsistency::Linearizable] {
        let output = command(&mut cluster, client, &Echo("Hello world!".into()), level);
        assert_eq!(output.unwrap(), "Hello world!", "{level:?}");
    }
    for level in [
        QueryConsistency::Causal,
        QueryConsistency::Sequential,
        QueryConsistency::BoundedLinearizable,
        QueryConsistency::Linearizable,
    ] {
        let output = query(&mut cluster, client, &EchoQuery("Hello world!".into()), level);
        assert_eq!(output.unwrap(), "Hello world!", "{level:?}");
    }

    cluster.run_for(Duration::from_millis(500));
    for &id in cluster.members() {
        assert_eq!(command_entries(&cluster, id), 3, "node {id}");
    }
}

#[test]
fn test_commands_apply_in_submission_order() {
    let (_dir, mut cluster) = start(3, seeded(13));
    let client = connect(&mut cluster, 1, ClientConfig::default());

    let now = cluster.now();
    let ids: Vec<_> = (1..=20)
        .map(|i| {
            cluster
                .client(client)
                .unwrap()
                .command(&Put { key: "k".into(), value: i.to_string() }, CommandConsistency::Linearizable, now)
                .unwrap()
        })
        .collect();
    for (i, id) in ids.into_iter().enumerate() {
        let output = cluster.run_until_done(client, id, WAIT).unwrap().unwrap();
        let previous: Option<String> = decode_output(&output).unwrap();
        let expected = if i == 0 { None } else { Some(i.to_string()) };
        assert_eq!(previous, expected);
    }
    assert_eq!(cluster.client(client).unwrap().acked_sequence(), 20);
}

#[test]
fn test_followers_redirect_leader_only_requests() {
    let (_dir, mut cluster) = start(3, seeded(14));
    let leader = cluster.leader().unwrap();
    let follower = cluster.members().iter().copied().find(|&id| id != leader).unwrap();
    // Let the follower learn the commit index.
    cluster.run_for(Duration::from_millis(200));
    let outsider = cluster.network().endpoint(Address::Client(99));
    let get = Operation::query(&Get { key: "k".into() }).unwrap();

    let query = |consistency| RequestKind::Query {
        session_id: 1,
        sequence: 0,
        index: 0,
        operation: get.clone(),
        consistency,
    };
    let requests = [
        query(QueryConsistency::Linearizable),
        query(QueryConsistency::BoundedLinearizable),
        RequestKind::Command {
            session_id: 1,
            sequence: 1,
            operation: get.clone(),
            consistency: CommandConsistency::Sequential,
        },
        // Served locally: index 1 is the leader's no-op, not a session.
        query(QueryConsistency::Causal),
    ];
    for (request_id, kind) in requests.into_iter().enumerate() {
        let request = ClientRequest {
            request_id: request_id as u64,
            kind,
        };
        outsider.send(Address::Node(follower), Message::Request(request));
    }
    cluster.settle();

    let mut results = Vec::new();
    while let Some(envelope) = outsider.try_recv() {
        if let Message::Response(response) = envelope.message {
            results.push((response.request_id, response.result));
        }
    }
    results.sort_by_key(|(id, _)| *id);
    let redirect = Err(ClientError::NotLeader {
        leader_hint: Some(leader),
    });
    assert_eq!(results.len(), 4);
    assert_eq!(results[0].1, redirect);
    assert_eq!(results[1].1, redirect);
    assert_eq!(results[2].1, redirect);
    assert_eq!(results[3].1, Err(ClientError::SessionUnknown(1)));
}

// =============================================================================
// STORAGE, SNAPSHOTS AND CONFIGURATION
// =============================================================================

#[test]
fn test_lagging_follower_installs_snapshot() {
    let config = NodeConfig {
        snapshot_threshold: 20,
        ..seeded(15)
    };
    let (_dir, mut cluster) = start(3, config);
    let leader = cluster.leader().unwrap();
    let lagging = cluster.members().iter().copied().find(|&id| id != leader).unwrap();
    let client = connect(&mut cluster, 1, ClientConfig::default());

    cluster.crash(lagging);
    for _ in 0..40 {
        command(&mut cluster, client, &Increment { key: "n".into(), by: 1 }, CommandConsistency::Linearizable).unwrap();
    }
    let leader = cluster.leader().unwrap();
    assert!(cluster.node(leader).unwrap().log().base_index() > 0);

    cluster.restart(lagging).unwrap();
    assert!(cluster.run_until(WAIT, |c| c.node(lagging).unwrap().executor().machine().counter("n") == 40));
    assert!(cluster.node(lagging).unwrap().log().base_index() > 0);

    // Restarting from the snapshot keeps the state.
    cluster.restart(lagging).unwrap();
    assert!(cluster.node(lagging).unwrap().log().base_index() > 0);
    assert!(cluster.run_until(WAIT, |c| c.node(lagging).unwrap().executor().machine().counter("n") == 40));
    assert!(cluster.checker().is_clean());
}

#[test]
fn test_restart_replays_log() {
    let (dir, mut cluster) = start(3, seeded(16));
    let client = connect(&mut cluster, 1, ClientConfig::default());
    command(&mut cluster, client, &Put { key: "a".into(), value: "1".into() }, CommandConsistency::Linearizable).unwrap();
    cluster.run_for(Duration::from_millis(300));

    let members = cluster.members().to_vec();
    for &id in &members {
        cluster.restart(id).unwrap();
        assert!(dir.path().join(format!("node-{id}")).join(META_FILE_NAME).exists());
    }
    // Entries are reapplied once a new leader re-establishes the commit index.
    assert!(cluster.run_until(WAIT, |c| members
        .iter()
        .all(|&id| c.node(id).unwrap().executor().machine().value("a") == Some("1"))));
    assert_eq!(command_entries(&cluster, members[0]), 1);
}

#[test]
fn test_leader_storage_fault_steps_down() {
    let (_dir, mut cluster) = start(3, seeded(17));
    let config = ClientConfig {
        request_timeout: Duration::from_millis(300),
        max_attempts: 50,
        ..ClientConfig::default()
    };
    let client = connect(&mut cluster, 1, config);
    let old = cluster.leader().unwrap();

    cluster.fail_storage(old, true);
    let result = command(&mut cluster, client, &Increment { key: "n".into(), by: 1 }, CommandConsistency::Linearizable);
    assert_eq!(result.unwrap(), 1);
    assert!(!cluster.node(old).unwrap().is_leader());
    assert!(cluster.node(old).unwrap().is_storage_faulted());

    cluster.fail_storage(old, false);
    assert!(cluster.run_until(WAIT, |c| {
        let node = c.node(old).unwrap();
        !node.is_storage_faulted() && node.executor().machine().counter("n") == 1
    }));
    assert!(cluster.checker().is_clean());
}

#[test]
fn test_configuration_change_applies_on_commit() {
    let (_dir, mut cluster) = start(3, seeded(18));
    let leader = cluster.leader().unwrap();
    let removed = cluster.members().iter().copied().find(|&id| id != leader).unwrap();
    let remaining: Vec<NodeId> = cluster.members().iter().copied().filter(|&id| id != removed).collect();

    let now = cluster.now();
    let node = cluster.node_mut(leader).unwrap();
    node.propose_configuration(remaining.clone(), now).unwrap();
    assert!(matches!(
        node.propose_configuration(remaining.clone(), now),
        Err(RaftError::ConfigurationPending)
    ));

    let other = remaining.iter().copied().find(|&id| id != leader).unwrap();
    assert!(matches!(
        cluster.node_mut(other).unwrap().propose_configuration(remaining.clone(), now),
        Err(RaftError::NotLeader)
    ));

    assert!(cluster.run_until(WAIT, |c| remaining
        .iter()
        .all(|&id| c.node(id).unwrap().members() == remaining.as_slice())));
    cluster.crash(removed);

    // Two of two now form the quorum.
    let client = connect(&mut cluster, 1, ClientConfig::default());
    assert_eq!(
        command(&mut cluster, client, &Increment { key: "n".into(), by: 3 }, CommandConsistency::Linearizable).unwrap(),
        3
    );
}

// =============================================================================
// ONE NODE, SCRIPTED PEERS
// =============================================================================

/// Node 1 of {1, 2, 3}, with nodes 2 and 3 played by the test.
struct ScriptedPeers {
    dir: TempDir,
    node: RaftNode<KvStore>,
    peers: [Endpoint; 2],
    now: Instant,
}

impl ScriptedPeers {
    fn new() -> Self {
        init_test_tracing();
        let dir = tempdir().unwrap();
        let network = MockNetwork::new();
        let peers = [network.endpoint(Address::Node(2)), network.endpoint(Address::Node(3))];
        let now = Instant::now();
        let node = RaftNode::open(
            1,
            dir.path(),
            vec![1, 2, 3],
            seeded(30),
            KvStore::new(),
            network.endpoint(Address::Node(1)),
            now,
        )
        .unwrap();
        ScriptedPeers { dir, node, peers, now }
    }

    fn peer(&self, id: NodeId) -> &Endpoint {
        &self.peers[(id - 2) as usize]
    }

    /// Deliver `msg` from `from`, returning the last thing the node sent back.
    fn deliver(&mut self, from: NodeId, msg: RaftMessage) -> Option<RaftMessage> {
        self.peer(from).send(Address::Node(1), Message::Raft(msg));
        self.node.process_all(self.now);
        self.drain(from)
    }

    fn drain(&self, id: NodeId) -> Option<RaftMessage> {
        let mut last = None;
        while let Some(envelope) = self.peer(id).try_recv() {
            if let Message::Raft(msg) = envelope.message {
                last = Some(msg);
            }
        }
        last
    }

    /// Move past the window in which a live leader suppresses votes.
    fn outlast_leader(&mut self) {
        self.now += self.node.config().election_timeout_min;
    }

    fn vote(&mut self, term: Term, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let request = RaftMessage::RequestVote {
            term,
            candidate_id: 3,
            last_log_index,
            last_log_term,
        };
        match self.deliver(3, request) {
            Some(RaftMessage::RequestVoteResponse { vote_granted, .. }) => vote_granted,
            other => panic!("expected a vote response, got {other:?}"),
        }
    }

    /// Campaign and win with node 2's vote. Returns the round of the
    /// leader's first append.
    fn elect(&mut self) -> u64 {
        self.now += self.node.config().election_timeout_max;
        self.node.tick(self.now);
        assert_eq!(self.node.role(), NodeRole::Candidate);
        self.drain(2);
        self.drain(3);
        let granted = RaftMessage::RequestVoteResponse {
            term: self.node.current_term(),
            vote_granted: true,
        };
        match self.deliver(2, granted) {
            Some(RaftMessage::AppendEntries { round, .. }) => {
                assert!(self.node.is_leader());
                round
            }
            other => panic!("expected an append, got {other:?}"),
        }
    }
}

fn entry(index: LogIndex, term: Term) -> LogEntry {
    LogEntry {
        index,
        term,
        kind: EntryKind::NoOp,
        session_id: 0,
        sequence: 0,
        timestamp_ns: index,
        payload: Vec::new(),
    }
}

/// An append from node 2 as leader of term 1.
fn append_from_2(prev_log_index: LogIndex, entries: Vec<LogEntry>) -> RaftMessage {
    RaftMessage::AppendEntries {
        term: 1,
        leader_id: 2,
        prev_log_index,
        prev_log_term: if prev_log_index == 0 { 0 } else { 1 },
        entries,
        leader_commit: 0,
        round: 1,
    }
}

fn accepted(reply: Option<RaftMessage>) -> bool {
    matches!(reply, Some(RaftMessage::AppendEntriesResponse { success: true, .. }))
}

#[test]
fn test_vote_refused_to_candidate_with_older_log() {
    let mut peers = ScriptedPeers::new();
    assert!(accepted(peers.deliver(2, append_from_2(0, vec![entry(1, 1)]))));
    peers.outlast_leader();

    // Longer but from an older term, then shorter.
    assert!(!peers.vote(2, 5, 0));
    assert!(!peers.vote(2, 0, 0));
    assert_eq!(peers.node.current_term(), 2);
    assert_eq!(peers.node.voted_for(), None);

    assert!(peers.vote(2, 1, 1));
    assert_eq!(peers.node.voted_for(), Some(3));
}

#[test]
fn test_live_leader_suppresses_votes() {
    let mut peers = ScriptedPeers::new();
    assert!(accepted(peers.deliver(2, append_from_2(0, vec![entry(1, 1)]))));
    assert!(!peers.vote(2, 1, 1));
    assert_eq!(peers.node.current_term(), 1);
    assert_eq!(peers.node.leader_id(), Some(2));
}

#[test]
fn test_storage_faulted_follower_refuses_vote() {
    let mut peers = ScriptedPeers::new();
    let faults = FaultInjector::new();
    peers.node.set_fault_injector(faults.clone());
    assert!(accepted(peers.deliver(2, append_from_2(0, vec![entry(1, 1)]))));

    faults.fail_writes(true);
    assert!(!accepted(peers.deliver(2, append_from_2(1, vec![entry(2, 1)]))));
    assert!(peers.node.is_storage_faulted());
    peers.outlast_leader();
    assert!(!peers.vote(2, 2, 1));
    assert_eq!(peers.node.current_term(), 1);
    assert_eq!(peers.node.voted_for(), None);

    // The next write that lands clears the fault.
    faults.fail_writes(false);
    assert!(accepted(peers.deliver(2, append_from_2(1, vec![entry(2, 1)]))));
    assert!(!peers.node.is_storage_faulted());
    peers.outlast_leader();
    assert!(peers.vote(2, 2, 1));
}

#[test]
fn test_leader_commits_only_entries_of_its_term() {
    let mut peers = ScriptedPeers::new();
    assert!(accepted(peers.deliver(2, append_from_2(0, vec![entry(1, 1)]))));
    let round = peers.elect();
    assert_eq!(peers.node.log().last_index(), 2);
    assert_eq!(peers.node.log().term_at(2), Some(2));

    // Index 1 is now on a majority, but it belongs to term 1.
    let ack = |match_index| RaftMessage::AppendEntriesResponse {
        term: 2,
        success: true,
        match_index,
        conflict_index: 0,
        round,
    };
    peers.deliver(2, ack(1));
    assert_eq!(peers.node.commit_index(), 0);
    assert_eq!(peers.node.last_applied(), 0);

    // Committing the term-2 no-op commits index 1 with it.
    peers.deliver(2, ack(2));
    assert_eq!(peers.node.commit_index(), 2);
    assert_eq!(peers.node.last_applied(), 2);
}

#[test]
fn test_leader_steps_down_when_new_term_cannot_be_persisted() {
    let mut peers = ScriptedPeers::new();
    let round = peers.elect();
    let term = peers.node.current_term();

    // A directory where the term record's temp file goes makes the write fail.
    std::fs::create_dir(peers.dir.path().join(META_FILE_NAME).with_extension("tmp")).unwrap();
    peers.deliver(
        2,
        RaftMessage::AppendEntriesResponse {
            term: 5,
            success: false,
            match_index: 0,
            conflict_index: 0,
            round,
        },
    );
    assert_eq!(peers.node.role(), NodeRole::Follower);
    assert_eq!(peers.node.leader_id(), None);
    assert!(peers.node.is_storage_faulted());
    assert_eq!(peers.node.current_term(), term);

    // It does not campaign while faulted.
    peers.now += peers.node.config().election_timeout_max;
    peers.node.tick(peers.now);
    assert_eq!(peers.node.role(), NodeRole::Follower);
    assert_eq!(peers.node.current_term(), term);
}

// =============================================================================
// THREADED
// =============================================================================

#[test]
fn test_threaded_cluster_serves_commands() {
    init_test_tracing();
    let dir = tempdir().unwrap();
    let network = MockNetwork::new();
    let members: Vec<NodeId> = vec![1, 2, 3];

    let handles: Vec<ServerHandle<KvStore>> = members
        .iter()
        .map(|&id| {
            let node = RaftNode::open(
                id,
                &dir.path().join(format!("node-{id}")),
                members.clone(),
                seeded(19),
                KvStore::new(),
                network.endpoint(Address::Node(id)),
                Instant::now(),
            )
            .unwrap();
            ServerHandle::spawn(node).unwrap()
        })
        .collect();

    let give_up = Instant::now() + WAIT;
    while !handles.iter().any(|h| h.status().role == NodeRole::Leader) {
        assert!(Instant::now() < give_up, "no leader elected");
        thread::sleep(Duration::from_millis(10));
    }

    let mut client = ClusterClient::new(
        7,
        members.clone(),
        ClientConfig::default(),
        network.endpoint(Address::Client(7)),
        Instant::now(),
    )
    .unwrap();
    client.open(Instant::now());
    client.wait_registered(WAIT).unwrap();

    let id = client
        .command(&Echo("over threads".into()), CommandConsistency::Linearizable, Instant::now())
        .unwrap();
    let output = client.wait_for(id, WAIT).unwrap();
    assert_eq!(decode_output::<String>(&output).unwrap(), "over threads");

    assert!(handles.iter().all(|h| h.is_running()));
    for handle in handles {
        let id = handle.id();
        let node = handle.stop().expect("node thread panicked");
        assert!(node.is_stopped(), "node {id}");
    }
}

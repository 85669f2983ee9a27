//! Chaos Integration Tests.
//!
//! Drives a simulated cluster through seeded faults and checks the safety
//! properties and exactly-once counters afterwards.

use std::time::Duration;

use tempfile::tempdir;

use crate::chaos::checker::{History, Outcome, ViolationKind};
use crate::chaos::cluster::SimCluster;
use crate::chaos::nemesis::{Fault, Nemesis, NemesisConfig};
use crate::config::{ClientConfig, NodeConfig};
use crate::kernel::kv::{Increment, KvStore, ReadCounter};
use crate::kernel::traits::decode_output;
use crate::raft::client::OperationId;
use crate::raft::error::ClientError;
use crate::raft::message::{CommandConsistency, QueryConsistency};
use crate::telemetry::init_test_tracing;

fn seeded(seed: u64) -> NodeConfig {
    NodeConfig {
        election_seed: Some(seed),
        snapshot_threshold: 50,
        ..NodeConfig::default()
    }
}

fn outcome(result: &Result<Vec<u8>, ClientError>) -> Outcome {
    match result {
        Ok(_) => Outcome::Acked,
        // The request may have been appended before the error.
        Err(_) => Outcome::Indeterminate,
    }
}

#[test]
fn test_history_bounds() {
    let mut history = History::new();
    history.record(1, "a", 2, Outcome::Acked);
    history.record(1, "a", 3, Outcome::Indeterminate);
    history.record(2, "b", 1, Outcome::Acked);
    history.record(2, "b", 7, Outcome::Rejected);

    let ok = history.verify(|key| if key == "a" { 5 } else { 1 });
    assert!(ok.passed, "{:?}", ok.violations);
    assert_eq!(ok.stats.acked, 2);
    assert_eq!(ok.stats.indeterminate, 1);
    assert_eq!(ok.stats.rejected, 1);

    // Lost an acknowledged increment.
    let lost = history.verify(|key| if key == "a" { 1 } else { 1 });
    assert!(!lost.passed);
    assert_eq!(lost.violations[0].kind, ViolationKind::CounterMismatch);

    // Applied a rejected one.
    let doubled = history.verify(|key| if key == "a" { 2 } else { 8 });
    assert!(!doubled.passed);
}

#[test]
fn test_checker_stays_clean_across_restarts() {
    init_test_tracing();
    let dir = tempdir().unwrap();
    let mut cluster: SimCluster = SimCluster::new(dir.path(), 3, seeded(11)).unwrap();
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).expect("no leader elected");

    let client = cluster.add_client(1, ClientConfig::default()).unwrap();
    assert!(cluster.wait_registered(client, Duration::from_secs(5)));
    for _ in 0..5 {
        let now = cluster.now();
        let op = cluster
            .client(client)
            .unwrap()
            .command(&Increment { key: "n".into(), by: 1 }, CommandConsistency::Linearizable, now)
            .unwrap();
        assert!(cluster.run_until_done(client, op, Duration::from_secs(5)).unwrap().is_ok());
    }

    cluster.restart(leader).unwrap();
    let follower = cluster.members().iter().copied().find(|&id| id != leader).unwrap();
    cluster.crash(follower);
    cluster.run_for(Duration::from_secs(1));
    cluster.restart(follower).unwrap();
    cluster.run_for(Duration::from_secs(2));

    assert!(cluster.checker().is_clean(), "{:?}", cluster.checker().violations());
    assert!(cluster.checker().max_committed() >= 7);
    for node in cluster.live_nodes() {
        assert_eq!(node.executor().machine().counter("n"), 5, "node {}", node.id());
    }
}

#[test]
fn test_nemesis_preserves_safety_and_exactly_once() {
    init_test_tracing();
    const CLUSTER_SIZE: u32 = 5;
    const NUM_CLIENTS: u64 = 3;
    const ROUNDS: usize = 30;

    let dir = tempdir().unwrap();
    let mut cluster: SimCluster<KvStore> = SimCluster::new(dir.path(), CLUSTER_SIZE, seeded(42)).unwrap();
    cluster.wait_for_leader(Duration::from_secs(5)).expect("no leader elected");

    let clients: Vec<u64> = (1..=NUM_CLIENTS)
        .map(|id| cluster.add_client(id, ClientConfig::default()).unwrap())
        .collect();
    for &client in &clients {
        assert!(cluster.wait_registered(client, Duration::from_secs(10)));
    }

    let mut nemesis = Nemesis::new(NemesisConfig {
        seed: 7,
        ..NemesisConfig::default()
    });
    let mut history = History::new();
    let mut in_flight: Vec<(u64, OperationId, u64)> = Vec::new();

    for round in 0..ROUNDS {
        for &client in &clients {
            let by = (round as u64 % 3) + 1;
            let now = cluster.now();
            let op = cluster
                .client(client)
                .unwrap()
                .command(&Increment { key: "total".into(), by }, CommandConsistency::Linearizable, now)
                .unwrap();
            in_flight.push((client, op, by));
        }
        nemesis.run(&mut cluster, Duration::from_millis(200));
    }

    // Stop injecting and let every operation finish.
    nemesis.inject(&mut cluster, Fault::Heal);
    for (client, op, by) in in_flight {
        let result = cluster
            .run_until_done(client, op, Duration::from_secs(30))
            .expect("operation never finished");
        history.record(client, "total", by, outcome(&result));
    }
    // Commands that failed for the caller are still resent until answered.
    let drained = cluster.run_until(Duration::from_secs(30), |c| {
        clients
            .iter()
            .all(|&id| c.client_ref(id).is_some_and(|client| client.acked_sequence() == ROUNDS as u64))
    });
    assert!(drained, "sessions still have unanswered commands");
    cluster.run_for(Duration::from_secs(1));

    let leader = cluster.wait_for_leader(Duration::from_secs(5)).expect("no leader after heal");
    let final_total = cluster.node(leader).unwrap().executor().machine().counter("total");
    let result = history.verify(|_| final_total);
    assert!(result.passed, "{:?} (faults: {:?})", result.violations, nemesis.history());
    assert!(result.stats.acked > 0);
    assert!(cluster.checker().is_clean(), "{:?}", cluster.checker().violations());
    assert!(nemesis.history().iter().any(|e| e.fault != Fault::Noop));

    // A linearizable read agrees with the leader's state.
    let reader = clients[0];
    let now = cluster.now();
    let query = cluster
        .client(reader)
        .unwrap()
        .query(&ReadCounter { key: "total".into() }, QueryConsistency::Linearizable, now)
        .unwrap();
    let output = cluster
        .run_until_done(reader, query, Duration::from_secs(10))
        .expect("read never finished")
        .unwrap();
    assert_eq!(decode_output::<u64>(&output).unwrap(), final_total);
}

#[test]
fn test_nemesis_fault_sequence_follows_seed() {
    init_test_tracing();
    let faults = |path: &std::path::Path| {
        let mut cluster: SimCluster = SimCluster::new(path, 3, seeded(3)).unwrap();
        let mut nemesis = Nemesis::new(NemesisConfig {
            seed: 99,
            fault_probability: 0.5,
            // Leader isolation depends on who leads; keep the sequence
            // a function of the seed alone.
            fault_weights: [0.0, 1.0, 1.0, 0.5, 2.0],
            ..NemesisConfig::default()
        });
        nemesis.run(&mut cluster, Duration::from_secs(3));
        nemesis.history().iter().map(|e| e.fault).collect::<Vec<_>>()
    };

    let a = tempdir().unwrap();
    let b = tempdir().unwrap();
    let first = faults(a.path());
    assert!(!first.is_empty());
    assert_eq!(first, faults(b.path()));
}

#[test]
fn test_isolated_leader_is_replaced() {
    init_test_tracing();
    let dir = tempdir().unwrap();
    let mut cluster: SimCluster = SimCluster::new(dir.path(), 5, seeded(5)).unwrap();
    let mut nemesis = Nemesis::new(NemesisConfig::default());

    let old = cluster.wait_for_leader(Duration::from_secs(5)).unwrap();
    nemesis.inject(&mut cluster, Fault::IsolateLeader);
    assert_eq!(nemesis.history()[0].targets, vec![old]);

    let replaced = cluster.run_until(Duration::from_secs(5), |c| {
        c.leader().is_some_and(|id| id != old) && !c.node(old).unwrap().is_leader()
    });
    assert!(replaced);

    nemesis.inject(&mut cluster, Fault::Heal);
    let converged = cluster.run_until(Duration::from_secs(10), |c| {
        let Some(leader) = c.leader() else {
            return false;
        };
        let term = c.node(leader).unwrap().current_term();
        c.live_nodes().all(|n| n.current_term() == term && n.leader_id() == Some(leader))
    });
    assert!(converged);
    let leader = cluster.leader().unwrap();
    let term = cluster.node(leader).unwrap().current_term();
    assert_eq!(cluster.node(old).unwrap().current_term(), term);
    assert_eq!(cluster.checker().leader_of(term), Some(leader));
    assert!(cluster.checker().is_clean());
}

//! Nemesis - The Fault Injector.
//!
//! Injects faults into a `SimCluster` from a seeded generator, so a failing
//! run can be replayed from its seed:
//! - IsolateLeader: Cuts the current leader off from every peer
//! - SplitMinority: Partitions a random minority from the rest
//! - Crash: Stops a random node, keeping a majority up
//! - StorageFault: Makes a random node's log writes fail
//! - Heal: Restores the network and storage and restarts crashed nodes

use std::collections::BTreeSet;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::engine::NodeId;
use crate::kernel::traits::StateMachine;

use super::cluster::SimCluster;

/// Types of faults the Nemesis can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Isolate the current leader.
    IsolateLeader,
    /// Partition a minority of nodes from the rest.
    SplitMinority,
    /// Stop one node until the next heal.
    Crash,
    /// Fail log writes on one node until the next heal.
    StorageFault,
    /// Undo every active fault.
    Heal,
    /// No operation (do nothing this tick).
    Noop,
}

/// Record of a fault injection event.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    /// Virtual time since the nemesis started.
    pub at: Duration,
    /// Type of fault.
    pub fault: Fault,
    /// Nodes the fault was aimed at.
    pub targets: Vec<NodeId>,
}

/// Configuration for the Nemesis.
#[derive(Debug, Clone)]
pub struct NemesisConfig {
    pub seed: u64,
    /// How often to consider injecting a fault.
    pub tick_interval: Duration,
    /// Probability of injecting a fault on each tick (0.0 - 1.0).
    pub fault_probability: f64,
    /// Weights for IsolateLeader, SplitMinority, Crash, StorageFault, Heal.
    pub fault_weights: [f64; 5],
    /// Heal this long after the last disruption.
    pub auto_heal_delay: Duration,
}

impl Default for NemesisConfig {
    fn default() -> Self {
        NemesisConfig {
            seed: 0,
            tick_interval: Duration::from_millis(100),
            fault_probability: 0.3,
            fault_weights: [1.0, 1.0, 1.0, 0.5, 2.0],
            auto_heal_delay: Duration::from_millis(600),
        }
    }
}

/// The Nemesis fault injector.
pub struct Nemesis {
    config: NemesisConfig,
    rng: StdRng,
    elapsed: Duration,
    last_disruption: Option<Duration>,
    crashed: BTreeSet<NodeId>,
    storage_faulted: BTreeSet<NodeId>,
    history: Vec<FaultEvent>,
}

impl Nemesis {
    pub fn new(config: NemesisConfig) -> Self {
        Nemesis {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            elapsed: Duration::ZERO,
            last_disruption: None,
            crashed: BTreeSet::new(),
            storage_faulted: BTreeSet::new(),
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[FaultEvent] {
        &self.history
    }

    /// Drive `cluster` for `duration`, considering a fault every tick.
    pub fn run<S: StateMachine + Default>(&mut self, cluster: &mut SimCluster<S>, duration: Duration) {
        let until = self.elapsed + duration;
        while self.elapsed < until {
            cluster.run_for(self.config.tick_interval);
            self.elapsed += self.config.tick_interval;
            self.tick(cluster);
        }
    }

    fn tick<S: StateMachine + Default>(&mut self, cluster: &mut SimCluster<S>) {
        let heal_due = self
            .last_disruption
            .is_some_and(|at| self.elapsed.saturating_sub(at) >= self.config.auto_heal_delay);
        if heal_due {
            self.inject(cluster, Fault::Heal);
            return;
        }
        if self.rng.gen_bool(self.config.fault_probability.clamp(0.0, 1.0)) {
            let fault = self.choose_fault();
            self.inject(cluster, fault);
        }
    }

    fn choose_fault(&mut self) -> Fault {
        const FAULTS: [Fault; 5] = [
            Fault::IsolateLeader,
            Fault::SplitMinority,
            Fault::Crash,
            Fault::StorageFault,
            Fault::Heal,
        ];
        let total: f64 = self.config.fault_weights.iter().sum();
        if total <= 0.0 {
            return Fault::Noop;
        }
        let mut pick = self.rng.gen_range(0.0..total);
        for (fault, weight) in FAULTS.iter().zip(self.config.fault_weights) {
            if pick < weight {
                return *fault;
            }
            pick -= weight;
        }
        Fault::Heal
    }

    /// Apply `fault` now and record it.
    pub fn inject<S: StateMachine + Default>(&mut self, cluster: &mut SimCluster<S>, fault: Fault) {
        let members = cluster.members().to_vec();
        let minority = (members.len() - 1) / 2;
        let targets = match fault {
            Fault::IsolateLeader => match cluster.leader() {
                Some(leader) => {
                    cluster.isolate(leader);
                    vec![leader]
                }
                None => Vec::new(),
            },
            Fault::SplitMinority => {
                let group: Vec<NodeId> = members
                    .choose_multiple(&mut self.rng, minority.max(1))
                    .copied()
                    .collect();
                cluster.partition(&group);
                group
            }
            Fault::Crash => {
                let up: Vec<NodeId> = members.iter().copied().filter(|id| !self.crashed.contains(id)).collect();
                match up.choose(&mut self.rng) {
                    Some(&id) if self.crashed.len() < minority => {
                        cluster.crash(id);
                        self.crashed.insert(id);
                        vec![id]
                    }
                    _ => Vec::new(),
                }
            }
            Fault::StorageFault => match members.choose(&mut self.rng) {
                Some(&id) => {
                    cluster.fail_storage(id, true);
                    self.storage_faulted.insert(id);
                    vec![id]
                }
                None => Vec::new(),
            },
            Fault::Heal => {
                cluster.heal();
                for id in std::mem::take(&mut self.storage_faulted) {
                    cluster.fail_storage(id, false);
                }
                let crashed: Vec<NodeId> = std::mem::take(&mut self.crashed).into_iter().collect();
                for &id in &crashed {
                    if let Err(e) = cluster.restart(id) {
                        tracing::warn!(node_id = id, error = %e, "restart after crash failed");
                        self.crashed.insert(id);
                    }
                }
                crashed
            }
            Fault::Noop => Vec::new(),
        };

        match fault {
            Fault::Heal => self.last_disruption = None,
            Fault::Noop => {}
            _ if !targets.is_empty() => self.last_disruption = Some(self.elapsed),
            _ => {}
        }
        tracing::info!(?fault, ?targets, elapsed_ms = self.elapsed.as_millis() as u64, "nemesis");
        self.history.push(FaultEvent {
            at: self.elapsed,
            fault,
            targets,
        });
    }
}

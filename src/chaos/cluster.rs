//! Deterministic multi-node driver.
//!
//! Runs every node and client in one thread on a virtual clock. Time only
//! moves when the driver says so, and messages are delivered in rounds, so
//! a seeded configuration replays the same history every time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::{ClientConfig, ConfigError, NodeConfig};
use crate::engine::fault_injection::FaultInjector;
use crate::engine::NodeId;
use crate::kernel::kv::KvStore;
use crate::kernel::session::ClientId;
use crate::kernel::traits::StateMachine;
use crate::raft::client::{ClusterClient, OperationId, OperationOutput, SessionStatus};
use crate::raft::error::RaftError;
use crate::raft::message::Address;
use crate::raft::network::MockNetwork;
use crate::raft::node::{ClockOrigin, NodeRole, RaftNode};

use super::checker::ClusterChecker;

/// Virtual time per `run_for` step.
pub const TICK: Duration = Duration::from_millis(5);

/// Delivery rounds per tick before giving up on quiescence.
const MAX_ROUNDS: usize = 10_000;

pub struct SimCluster<S: StateMachine + Default = KvStore> {
    network: MockNetwork,
    base_dir: PathBuf,
    config: NodeConfig,
    members: Vec<NodeId>,
    origin: ClockOrigin,
    now: Instant,
    /// `None` while a node is crashed.
    nodes: BTreeMap<NodeId, Option<RaftNode<S>>>,
    faults: BTreeMap<NodeId, FaultInjector>,
    clients: BTreeMap<ClientId, ClusterClient>,
    checker: ClusterChecker,
}

impl<S: StateMachine + Default> SimCluster<S> {
    /// Start `size` nodes with ids `1..=size`, each in its own directory
    /// under `base_dir`.
    pub fn new(base_dir: &Path, size: u32, config: NodeConfig) -> Result<Self, RaftError> {
        let now = Instant::now();
        let mut cluster = SimCluster {
            network: MockNetwork::new(),
            base_dir: base_dir.to_path_buf(),
            config,
            members: (1..=size).collect(),
            origin: ClockOrigin::new(now),
            now,
            nodes: BTreeMap::new(),
            faults: BTreeMap::new(),
            clients: BTreeMap::new(),
            checker: ClusterChecker::new(),
        };
        for id in cluster.members.clone() {
            cluster.faults.insert(id, FaultInjector::new());
            let node = cluster.open_node(id)?;
            cluster.nodes.insert(id, Some(node));
        }
        Ok(cluster)
    }

    fn open_node(&self, id: NodeId) -> Result<RaftNode<S>, RaftError> {
        let endpoint = self.network.endpoint(Address::Node(id));
        let mut node = RaftNode::open(
            id,
            &self.node_dir(id),
            self.members.clone(),
            self.config.clone(),
            S::default(),
            endpoint,
            self.now,
        )?;
        node.set_clock_origin(self.origin);
        if let Some(faults) = self.faults.get(&id) {
            node.set_fault_injector(faults.clone());
        }
        Ok(node)
    }

    pub fn node_dir(&self, id: NodeId) -> PathBuf {
        self.base_dir.join(format!("node-{id}"))
    }

    // =========================================================================
    // TIME
    // =========================================================================

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Deliver messages until nothing moves, without advancing time.
    pub fn settle(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let mut handled = 0;
            for node in self.nodes.values_mut().flatten() {
                handled += node.step(self.now);
            }
            for client in self.clients.values_mut() {
                client.poll(self.now);
            }
            for node in self.nodes.values().flatten() {
                self.checker.observe(node);
            }
            if handled == 0 && self.inboxes_empty() {
                return;
            }
        }
        tracing::warn!("cluster did not quiesce");
    }

    fn inboxes_empty(&self) -> bool {
        self.nodes.values().flatten().all(|n| n.endpoint().pending() == 0)
    }

    /// Advance virtual time by `duration` in ticks.
    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now + duration;
        while self.now < until {
            self.now += TICK;
            self.settle();
        }
    }

    /// Run until `done` holds or `timeout` of virtual time passes.
    pub fn run_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let until = self.now + timeout;
        self.settle();
        while !done(self) {
            if self.now >= until {
                return false;
            }
            self.now += TICK;
            self.settle();
        }
        true
    }

    pub fn wait_for_leader(&mut self, timeout: Duration) -> Option<NodeId> {
        self.run_until(timeout, |c| c.leader().is_some());
        self.leader()
    }

    // =========================================================================
    // NODES
    // =========================================================================

    /// The live leader with the highest term, if any.
    pub fn leader(&self) -> Option<NodeId> {
        self.live_nodes()
            .filter(|n| n.role() == NodeRole::Leader)
            .max_by_key(|n| n.current_term())
            .map(|n| n.id())
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn node(&self, id: NodeId) -> Option<&RaftNode<S>> {
        self.nodes.get(&id).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut RaftNode<S>> {
        self.nodes.get_mut(&id).and_then(Option::as_mut)
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &RaftNode<S>> {
        self.nodes.values().flatten()
    }

    pub fn is_up(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Stop a node. Its inbox disappears with it.
    pub fn crash(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(&id) {
            if let Some(mut node) = slot.take() {
                node.shutdown();
                tracing::info!(node_id = id, "crashed node");
            }
        }
        self.network.unregister(Address::Node(id));
    }

    /// Reopen a crashed (or running) node from its directory.
    pub fn restart(&mut self, id: NodeId) -> Result<(), RaftError> {
        self.crash(id);
        let node = self.open_node(id)?;
        self.nodes.insert(id, Some(node));
        tracing::info!(node_id = id, "restarted node");
        Ok(())
    }

    pub fn fail_storage(&self, id: NodeId, enabled: bool) {
        if let Some(faults) = self.faults.get(&id) {
            faults.fail_writes(enabled);
        }
    }

    // =========================================================================
    // NETWORK
    // =========================================================================

    pub fn network(&self) -> &MockNetwork {
        &self.network
    }

    pub fn isolate(&self, id: NodeId) {
        self.network.isolate(Address::Node(id));
    }

    /// Cut `group` off from every other member. Clients can still reach
    /// both sides.
    pub fn partition(&self, group: &[NodeId]) {
        let side_a: Vec<Address> = group.iter().map(|&id| Address::Node(id)).collect();
        let side_b: Vec<Address> = self
            .members
            .iter()
            .filter(|id| !group.contains(id))
            .map(|&id| Address::Node(id))
            .collect();
        self.network.partition(&side_a, &side_b);
    }

    pub fn heal(&self) {
        self.network.heal();
    }

    // =========================================================================
    // CLIENTS
    // =========================================================================

    /// Attach a client and start registering its session.
    pub fn add_client(&mut self, client_id: ClientId, config: ClientConfig) -> Result<ClientId, ConfigError> {
        let endpoint = self.network.endpoint(Address::Client(client_id));
        let mut client = ClusterClient::new(client_id, self.members.clone(), config, endpoint, self.now)?;
        client.open(self.now);
        self.clients.insert(client_id, client);
        Ok(client_id)
    }

    pub fn client(&mut self, client_id: ClientId) -> Option<&mut ClusterClient> {
        self.clients.get_mut(&client_id)
    }

    pub fn client_ref(&self, client_id: ClientId) -> Option<&ClusterClient> {
        self.clients.get(&client_id)
    }

    pub fn client_status(&self, client_id: ClientId) -> Option<SessionStatus> {
        self.clients.get(&client_id).map(|c| c.status().clone())
    }

    /// Drop a client without closing its session.
    pub fn remove_client(&mut self, client_id: ClientId) -> Option<ClusterClient> {
        self.network.unregister(Address::Client(client_id));
        self.clients.remove(&client_id)
    }

    /// Run until `client_id`'s session is open.
    pub fn wait_registered(&mut self, client_id: ClientId, timeout: Duration) -> bool {
        self.run_until(timeout, |c| {
            c.clients.get(&client_id).is_some_and(|client| client.session_id().is_some())
        })
    }

    /// Run until operation `id` of `client_id` finishes, then take its result.
    pub fn run_until_done(&mut self, client_id: ClientId, id: OperationId, timeout: Duration) -> Option<OperationOutput> {
        self.run_until(timeout, |c| c.clients.get(&client_id).is_some_and(|client| client.is_done(id)));
        self.clients.get_mut(&client_id)?.take_result(id)
    }

    // =========================================================================
    // CHECKING
    // =========================================================================

    pub fn checker(&self) -> &ClusterChecker {
        &self.checker
    }
}

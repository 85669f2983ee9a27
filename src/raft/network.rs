//! In-process transport for nodes and clients.
//!
//! Uses crossbeam channels to simulate network communication. Every
//! address owns one inbox; links can be cut per direction, per address or
//! by partition, and healed again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::message::{Address, Envelope, Message};

#[derive(Default)]
struct Routes {
    inboxes: HashMap<Address, Sender<Envelope>>,
    /// Directed links that drop everything.
    blocked: HashSet<(Address, Address)>,
    /// Addresses cut off from everyone.
    isolated: HashSet<Address>,
}

/// Shared network handle. Cloning is cheap; every clone sees the same
/// routes and faults.
#[derive(Clone, Default)]
pub struct MockNetwork {
    routes: Arc<RwLock<Routes>>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Routes> {
        self.routes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the inbox for `address`.
    ///
    /// Registering an address again (a restarted node) replaces the old
    /// inbox; messages queued for the old one are lost.
    pub fn endpoint(&self, address: Address) -> Endpoint {
        let (tx, rx) = unbounded();
        self.write().inboxes.insert(address, tx);
        Endpoint {
            address,
            rx,
            network: self.clone(),
        }
    }

    /// Remove an inbox. Messages sent to it are dropped.
    pub fn unregister(&self, address: Address) {
        self.write().inboxes.remove(&address);
    }

    /// Deliver a message if the link is up. Returns whether it was queued.
    pub fn send(&self, from: Address, to: Address, message: Message) -> bool {
        let routes = self.read();
        if !Self::link_up(&routes, from, to) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let sent = match routes.inboxes.get(&to) {
            Some(tx) => tx.send(Envelope { from, to, message }).is_ok(),
            None => false,
        };
        if sent {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    fn link_up(routes: &Routes, from: Address, to: Address) -> bool {
        !routes.isolated.contains(&from)
            && !routes.isolated.contains(&to)
            && !routes.blocked.contains(&(from, to))
    }

    /// Cut `address` off from every other address, clients included.
    pub fn isolate(&self, address: Address) {
        self.write().isolated.insert(address);
    }

    /// Drop everything between the two groups, in both directions.
    pub fn partition(&self, side_a: &[Address], side_b: &[Address]) {
        let mut routes = self.write();
        for &a in side_a {
            for &b in side_b {
                routes.blocked.insert((a, b));
                routes.blocked.insert((b, a));
            }
        }
    }

    /// Drop messages from `from` to `to` only.
    pub fn block(&self, from: Address, to: Address) {
        self.write().blocked.insert((from, to));
    }

    pub fn heal(&self) {
        let mut routes = self.write();
        routes.blocked.clear();
        routes.isolated.clear();
    }

    pub fn is_reachable(&self, from: Address, to: Address) -> bool {
        let routes = self.read();
        Self::link_up(&routes, from, to) && routes.inboxes.contains_key(&to)
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The inbox was replaced or unregistered; nothing will arrive again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// One address's view of the network.
pub struct Endpoint {
    address: Address,
    rx: Receiver<Envelope>,
    network: MockNetwork,
}

impl Endpoint {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn network(&self) -> &MockNetwork {
        &self.network
    }

    /// Fire-and-forget send. Returns false if the message was dropped.
    pub fn send(&self, to: Address, message: Message) -> bool {
        self.network.send(self.address, to, message)
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Receive with timeout. `Ok(None)` when nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, Disconnected> {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Disconnected),
        }
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

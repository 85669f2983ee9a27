//! Threaded node runner.
//!
//! Runs each RaftNode in its own thread. The thread owns the node (and so
//! its log and manifest) until `stop` hands it back.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::NodeId;
use crate::kernel::traits::StateMachine;

use super::node::{NodeStatus, RaftNode};

/// Longest the loop sleeps waiting for a message before looking at its
/// timers and the stop flag again.
const MAX_WAIT: Duration = Duration::from_millis(10);

/// Handle to a running node thread.
pub struct ServerHandle<S: StateMachine> {
    id: NodeId,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<NodeStatus>>,
    thread: Option<JoinHandle<RaftNode<S>>>,
}

impl<S: StateMachine> ServerHandle<S> {
    pub fn spawn(mut node: RaftNode<S>) -> io::Result<Self> {
        let id = node.id();
        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(node.status()));

        let thread = {
            let stop = Arc::clone(&stop);
            let status = Arc::clone(&status);
            thread::Builder::new()
                .name(format!("raft-node-{id}"))
                .spawn(move || {
                    run(&mut node, &stop, &status);
                    node
                })?
        };
        Ok(ServerHandle {
            id,
            stop,
            status,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Latest status published by the node thread.
    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and take the node back. `None` if the thread panicked.
    pub fn stop(mut self) -> Option<RaftNode<S>> {
        self.stop.store(true, Ordering::SeqCst);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(node) => Some(node),
            Err(_) => {
                tracing::error!(node_id = self.id, "node thread panicked");
                None
            }
        }
    }
}

impl<S: StateMachine> Drop for ServerHandle<S> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(node_id = self.id, "node thread panicked");
            }
        }
    }
}

fn run<S: StateMachine>(node: &mut RaftNode<S>, stop: &AtomicBool, status: &Mutex<NodeStatus>) {
    tracing::info!(node_id = node.id(), "node thread started");
    while !stop.load(Ordering::SeqCst) {
        let wait = node
            .next_deadline()
            .saturating_duration_since(Instant::now())
            .min(MAX_WAIT);
        match node.endpoint().recv_timeout(wait) {
            Ok(Some(envelope)) => node.handle(envelope, Instant::now()),
            Ok(None) => {}
            Err(_) => {
                tracing::warn!(node_id = node.id(), "endpoint disconnected, stopping");
                break;
            }
        }
        node.step(Instant::now());
        let current = node.status();
        *status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = current;
    }
    node.shutdown();
    tracing::info!(node_id = node.id(), "node thread stopped");
}

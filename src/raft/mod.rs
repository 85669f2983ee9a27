//! Raft consensus, client sessions and consistency routing.
//!
//! This module implements:
//! - Leader election with randomized timeouts and leader stickiness
//! - Log replication with commit on current-term majority
//! - Read-index, lease and log-marker reads
//! - A retrying client proxy and a threaded node runner
//!
//! Uses MockNetwork (crossbeam channels) for testing.

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod network;
pub mod node;
pub mod pending;
pub mod quorum;
pub mod server;

#[cfg(test)]
mod tests;

pub use client::{ClusterClient, OperationId, OperationOutput, SessionStatus};
pub use dispatcher::NodeRole;
pub use error::{ClientError, RaftError};
pub use message::{
    Address, ClientReply, ClientRequest, ClientResponse, CommandConsistency, Envelope, Message,
    QueryConsistency, RaftMessage, RequestKind,
};
pub use network::{Endpoint, MockNetwork};
pub use node::{ClockOrigin, NodeStatus, RaftNode};
pub use server::ServerHandle;

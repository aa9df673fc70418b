//! Peer node for the lockstep coordination service.
//!
//! The node is a thin async shell around
//! [`lockstep_core::CoordinatorCore`]: one actor task owns all protocol
//! state, inbound connections and the operator API only enqueue typed
//! events and commands, and per-peer writer tasks drain outbound
//! messages with reconnect and backoff.

#![warn(clippy::pedantic)]

use std::fmt;

pub mod actor;
pub mod api;
pub mod connector;
pub mod directory;
pub mod inbound;
pub mod outbound;
pub mod registry;

pub use actor::{Command, HandleError, NodeActor, NodeHandle, Status};
pub use connector::{Dial, TokioDial};
pub use directory::PeerDirectory;
pub use inbound::serve_peer;
pub use outbound::{PeerLink, spawn_writer};
pub use registry::{Registration, RegistryClient};

/// Context for operational failures in the node shell.
#[derive(Debug)]
pub struct NodeError;

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("node operation failed")
    }
}

impl std::error::Error for NodeError {}

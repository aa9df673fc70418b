//! Central account registry for the lockstep coordination service.
//!
//! The registry is the one shared mutable resource outside the peers: it
//! assigns node ids, holds the balance table, and applies atomic debits
//! and credits. Serialization across peers is provided by the
//! mutual-exclusion protocol itself, so each operation here only needs to
//! be atomic on its own.
//!
//! Registration is a barrier: the registry is told the cluster size up
//! front and withholds every `Register` response until all nodes have
//! joined, then answers each with the complete peer directory. From that
//! point membership is immutable.

#![warn(clippy::pedantic)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use lockstep_core::{Amount, NodeId, PeerInfo, RegistryRequest, RegistryResponse};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod api;
pub mod server;

pub use server::serve_connection;

#[derive(Debug)]
pub struct RegistryError;

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("registry operation failed")
    }
}

impl std::error::Error for RegistryError {}

struct State {
    accounts: BTreeMap<NodeId, Amount>,
    endpoints: BTreeMap<NodeId, String>,
    next_id: NodeId,
    /// Flips to `true` once the expected number of nodes has registered.
    complete_tx: watch::Sender<bool>,
}

/// Shared registry state. Cheap to clone; all clones see the same table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<State>>,
    cluster_size: usize,
    initial_balance: Amount,
    complete_rx: watch::Receiver<bool>,
}

impl Registry {
    #[must_use]
    pub fn new(cluster_size: usize, initial_balance: Amount) -> Self {
        let (complete_tx, complete_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(State {
                accounts: BTreeMap::new(),
                endpoints: BTreeMap::new(),
                next_id: 1,
                complete_tx,
            })),
            cluster_size,
            initial_balance,
            complete_rx,
        }
    }

    /// Handle one request. `Register` suspends on the cluster barrier;
    /// everything else answers immediately.
    pub async fn handle(&self, request: RegistryRequest) -> RegistryResponse {
        match request {
            RegistryRequest::Register { endpoint } => self.register(endpoint).await,
            RegistryRequest::Debit { node, amount } => self.debit(node, amount),
            RegistryRequest::Credit { node, amount } => self.credit(node, amount),
            RegistryRequest::Balance { node } => self.balance(node),
        }
    }

    async fn register(&self, endpoint: String) -> RegistryResponse {
        let node_id = {
            let mut state = self.inner.lock().expect("registry lock poisoned");
            if state.endpoints.len() >= self.cluster_size {
                warn!(%endpoint, "registration after the cluster completed");
                return RegistryResponse::RegistrationClosed;
            }
            let node_id = state.next_id;
            state.next_id += 1;
            state.accounts.insert(node_id, self.initial_balance);
            state.endpoints.insert(node_id, endpoint.clone());
            info!(
                node_id,
                %endpoint,
                registered = state.endpoints.len(),
                expected = self.cluster_size,
                "node registered"
            );
            if state.endpoints.len() == self.cluster_size {
                let _ = state.complete_tx.send(true);
            }
            node_id
        };

        // Hold the response until every expected node has joined, so all
        // nodes bootstrap with the same immutable directory.
        let mut complete = self.complete_rx.clone();
        // the barrier can only open once; a lost sender cannot happen
        // while `self` is alive
        let _ = complete.wait_for(|done| *done).await;

        let state = self.inner.lock().expect("registry lock poisoned");
        let peers = state
            .endpoints
            .iter()
            .filter(|(id, _)| **id != node_id)
            .map(|(id, endpoint)| PeerInfo {
                id: *id,
                endpoint: endpoint.clone(),
            })
            .collect();
        RegistryResponse::Registered {
            node_id,
            initial_balance: self.initial_balance,
            peers,
        }
    }

    fn debit(&self, node: NodeId, amount: Amount) -> RegistryResponse {
        let mut state = self.inner.lock().expect("registry lock poisoned");
        let Some(balance) = state.accounts.get_mut(&node) else {
            return RegistryResponse::UnknownNode;
        };
        if *balance < amount {
            debug!(node, amount, balance = *balance, "debit rejected");
            return RegistryResponse::Insufficient;
        }
        *balance -= amount;
        debug!(node, amount, balance = *balance, "debited");
        RegistryResponse::DebitOk
    }

    fn credit(&self, node: NodeId, amount: Amount) -> RegistryResponse {
        let mut state = self.inner.lock().expect("registry lock poisoned");
        let Some(balance) = state.accounts.get_mut(&node) else {
            return RegistryResponse::UnknownNode;
        };
        *balance += amount;
        debug!(node, amount, balance = *balance, "credited");
        RegistryResponse::CreditOk
    }

    fn balance(&self, node: NodeId) -> RegistryResponse {
        let state = self.inner.lock().expect("registry lock poisoned");
        match state.accounts.get(&node) {
            Some(balance) => RegistryResponse::Balance(*balance),
            None => RegistryResponse::UnknownNode,
        }
    }

    /// Snapshot of the balance table, for the operator surface.
    ///
    /// # Panics
    ///
    /// Panics if the registry lock is poisoned.
    #[must_use]
    pub fn accounts(&self) -> Vec<(NodeId, Amount)> {
        let state = self.inner.lock().expect("registry lock poisoned");
        state
            .accounts
            .iter()
            .map(|(id, balance)| (*id, *balance))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registration_barrier_releases_all_with_full_directory() {
        let registry = Registry::new(2, 100);

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .handle(RegistryRequest::Register {
                        endpoint: "node-a:7500".into(),
                    })
                    .await
            })
        };
        // the first registration must not resolve on its own
        tokio::task::yield_now().await;
        assert!(!first.is_finished());

        let second = registry
            .handle(RegistryRequest::Register {
                endpoint: "node-b:7500".into(),
            })
            .await;
        let first = first.await.unwrap();

        let RegistryResponse::Registered {
            node_id: id_a,
            initial_balance,
            peers: peers_a,
        } = first
        else {
            panic!("expected Registered, got {first:?}");
        };
        assert_eq!(initial_balance, 100);
        assert_eq!(id_a, 1);
        assert_eq!(peers_a.len(), 1);
        assert_eq!(peers_a[0].id, 2);
        assert_eq!(peers_a[0].endpoint, "node-b:7500");

        let RegistryResponse::Registered {
            node_id: id_b,
            peers: peers_b,
            ..
        } = second
        else {
            panic!("expected Registered, got {second:?}");
        };
        assert_eq!(id_b, 2);
        assert_eq!(peers_b[0].id, 1);
    }

    #[tokio::test]
    async fn registration_closes_after_cluster_completes() {
        let registry = Registry::new(1, 50);
        let response = registry
            .handle(RegistryRequest::Register {
                endpoint: "only:7500".into(),
            })
            .await;
        assert!(matches!(response, RegistryResponse::Registered { .. }));

        let late = registry
            .handle(RegistryRequest::Register {
                endpoint: "late:7500".into(),
            })
            .await;
        assert_eq!(late, RegistryResponse::RegistrationClosed);
    }

    #[tokio::test]
    async fn debit_is_atomic_check_and_subtract() {
        let registry = Registry::new(1, 30);
        registry
            .handle(RegistryRequest::Register {
                endpoint: "n:1".into(),
            })
            .await;

        assert_eq!(
            registry
                .handle(RegistryRequest::Debit { node: 1, amount: 20 })
                .await,
            RegistryResponse::DebitOk
        );
        assert_eq!(
            registry
                .handle(RegistryRequest::Debit { node: 1, amount: 20 })
                .await,
            RegistryResponse::Insufficient
        );
        assert_eq!(
            registry.handle(RegistryRequest::Balance { node: 1 }).await,
            RegistryResponse::Balance(10)
        );

        assert_eq!(
            registry
                .handle(RegistryRequest::Credit { node: 1, amount: 5 })
                .await,
            RegistryResponse::CreditOk
        );
        assert_eq!(
            registry.handle(RegistryRequest::Balance { node: 1 }).await,
            RegistryResponse::Balance(15)
        );
    }

    #[tokio::test]
    async fn unknown_node_is_reported() {
        let registry = Registry::new(1, 10);
        assert_eq!(
            registry.handle(RegistryRequest::Balance { node: 9 }).await,
            RegistryResponse::UnknownNode
        );
        assert_eq!(
            registry
                .handle(RegistryRequest::Debit { node: 9, amount: 1 })
                .await,
            RegistryResponse::UnknownNode
        );
    }
}

//! Client for the account registry.

use std::io;

use error_stack::{Report, ResultExt};
use futures::{Sink, SinkExt, Stream, StreamExt};
use lockstep_core::{Amount, NodeId, PeerInfo, RegistryRequest, RegistryResponse};
use tracing::debug;

use crate::NodeError;

/// What the registry hands back once the whole cluster has registered.
#[derive(Debug, Clone)]
pub struct Registration {
    pub node_id: NodeId,
    pub initial_balance: Amount,
    pub peers: Vec<PeerInfo>,
}

/// Request/response client over one framed connection.
///
/// The registry answers strictly in order on a connection, so a plain
/// send-then-receive per call is all the discipline needed.
pub struct RegistryClient<T> {
    conn: T,
}

impl<T> RegistryClient<T>
where
    T: Sink<RegistryRequest, Error = io::Error>
        + Stream<Item = io::Result<RegistryResponse>>
        + Unpin,
{
    pub fn new(conn: T) -> Self {
        Self { conn }
    }

    async fn call(&mut self, request: RegistryRequest) -> Result<RegistryResponse, Report<NodeError>> {
        self.conn
            .send(request)
            .await
            .change_context(NodeError)
            .attach("failed to send registry request")?;
        match self.conn.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(err)) => Err(Report::new(NodeError).attach(err.to_string())),
            None => Err(Report::new(NodeError).attach("registry closed the connection")),
        }
    }

    /// Register this node. Blocks until the whole cluster has joined.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, when the cluster is already complete,
    /// or on a response that is not a registration.
    pub async fn register(&mut self, endpoint: &str) -> Result<Registration, Report<NodeError>> {
        debug!(endpoint, "registering");
        match self
            .call(RegistryRequest::Register {
                endpoint: endpoint.to_owned(),
            })
            .await?
        {
            RegistryResponse::Registered {
                node_id,
                initial_balance,
                peers,
            } => Ok(Registration {
                node_id,
                initial_balance,
                peers,
            }),
            RegistryResponse::RegistrationClosed => {
                Err(Report::new(NodeError).attach("the cluster is already complete"))
            }
            other => Err(Report::new(NodeError).attach(format!("unexpected response {other:?}"))),
        }
    }

    /// Atomic debit. `Ok(false)` means the balance was insufficient and
    /// nothing changed.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or an unknown account.
    pub async fn debit(&mut self, node: NodeId, amount: Amount) -> Result<bool, Report<NodeError>> {
        match self.call(RegistryRequest::Debit { node, amount }).await? {
            RegistryResponse::DebitOk => Ok(true),
            RegistryResponse::Insufficient => Ok(false),
            other => Err(Report::new(NodeError).attach(format!("unexpected response {other:?}"))),
        }
    }

    /// # Errors
    ///
    /// Fails on transport errors or an unknown account.
    pub async fn credit(&mut self, node: NodeId, amount: Amount) -> Result<(), Report<NodeError>> {
        match self.call(RegistryRequest::Credit { node, amount }).await? {
            RegistryResponse::CreditOk => Ok(()),
            other => Err(Report::new(NodeError).attach(format!("unexpected response {other:?}"))),
        }
    }

    /// # Errors
    ///
    /// Fails on transport errors or an unknown account.
    pub async fn balance(&mut self, node: NodeId) -> Result<Amount, Report<NodeError>> {
        match self.call(RegistryRequest::Balance { node }).await? {
            RegistryResponse::Balance(amount) => Ok(amount),
            other => Err(Report::new(NodeError).attach(format!("unexpected response {other:?}"))),
        }
    }
}

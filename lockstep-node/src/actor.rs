//! The node actor: one task owning all protocol state.
//!
//! Everything that mutates the clock, the queue, the self-request slot
//! or the ledger happens here, in event order. Inbound connections and
//! the operator API communicate with the actor exclusively through
//! channels, which gives every message receipt a happens-before edge to
//! every later state read.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;

use futures::{Sink, Stream};
use lockstep_core::{
    Amount, Block, CoordinatorCore, Effect, Envelope, NodeId, Outcome, Phase, Transaction,
    Transfer, TransferError,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::PeerLink;
use crate::registry::RegistryClient;

/// Commands from the operator surface.
pub enum Command {
    Transfer {
        transfer: Transfer,
        reply: oneshot::Sender<Result<Outcome, TransferError>>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
    Ledger {
        reply: oneshot::Sender<Vec<Block>>,
    },
}

/// One pending request, as shown to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub time: u64,
    pub initiator: NodeId,
    pub dst: NodeId,
    pub amount: Amount,
}

/// Inspection snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub node_id: NodeId,
    pub clock: u64,
    pub phase: &'static str,
    /// `None` when the registry could not be reached.
    pub balance: Option<Amount>,
    pub peers: Vec<NodeId>,
    /// Peers whose writer has exhausted its failure threshold. A stalled
    /// self-request shows up here.
    pub unreachable_peers: Vec<NodeId>,
    pub queue: Vec<QueueItem>,
    pub ledger_len: usize,
    pub ledger_head: String,
    pub halted: bool,
}

/// Why a [`NodeHandle`] call failed.
#[derive(Debug)]
pub enum HandleError {
    /// The coordinator rejected the transfer outright.
    Rejected(TransferError),
    /// The actor is gone.
    Closed,
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(err) => write!(f, "transfer rejected: {err}"),
            Self::Closed => f.write_str("node actor is not running"),
        }
    }
}

impl std::error::Error for HandleError {}

/// Cheap handle for talking to the actor.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
}

impl NodeHandle {
    /// Run a transfer to completion and return its outcome.
    ///
    /// This resolves once the release has been broadcast — or never, if
    /// a peer stays unreachable; the caller decides how long to wait.
    ///
    /// # Errors
    ///
    /// [`HandleError::Rejected`] when the coordinator refuses the
    /// transfer, [`HandleError::Closed`] when the actor is gone.
    pub async fn transfer(&self, transfer: Transfer) -> Result<Outcome, HandleError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Transfer { transfer, reply })
            .await
            .map_err(|_| HandleError::Closed)?;
        match done.await {
            Ok(result) => result.map_err(HandleError::Rejected),
            Err(_) => Err(HandleError::Closed),
        }
    }

    /// # Errors
    ///
    /// [`HandleError::Closed`] when the actor is gone.
    pub async fn status(&self) -> Result<Status, HandleError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .await
            .map_err(|_| HandleError::Closed)?;
        done.await.map_err(|_| HandleError::Closed)
    }

    /// # Errors
    ///
    /// [`HandleError::Closed`] when the actor is gone.
    pub async fn ledger(&self) -> Result<Vec<Block>, HandleError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Ledger { reply })
            .await
            .map_err(|_| HandleError::Closed)?;
        done.await.map_err(|_| HandleError::Closed)
    }
}

pub struct NodeActor<R> {
    core: CoordinatorCore,
    registry: RegistryClient<R>,
    links: BTreeMap<NodeId, PeerLink>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    commands: mpsc::Receiver<Command>,
    /// Resolved when the in-flight transfer finishes.
    completion: Option<oneshot::Sender<Result<Outcome, TransferError>>>,
}

impl<R> NodeActor<R>
where
    R: Sink<lockstep_core::RegistryRequest, Error = io::Error>
        + Stream<Item = io::Result<lockstep_core::RegistryResponse>>
        + Unpin,
{
    pub fn new(
        core: CoordinatorCore,
        registry: RegistryClient<R>,
        links: BTreeMap<NodeId, PeerLink>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> (Self, NodeHandle) {
        let (commands_tx, commands) = mpsc::channel(16);
        (
            Self {
                core,
                registry,
                links,
                inbound,
                commands,
                completion: None,
            },
            NodeHandle {
                commands: commands_tx,
            },
        )
    }

    pub async fn run(mut self) {
        debug!(node_id = self.core.node_id(), "actor started");
        loop {
            tokio::select! {
                Some(envelope) = self.inbound.recv() => {
                    let effects = self.core.handle_envelope(envelope);
                    self.run_effects(effects).await;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
            }
        }
        debug!(node_id = self.core.node_id(), "actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Transfer { transfer, reply } => match self.core.begin_transfer(transfer) {
                Ok(effects) => {
                    self.completion = Some(reply);
                    self.run_effects(effects).await;
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::Status { reply } => {
                let status = self.status().await;
                let _ = reply.send(status);
            }
            Command::Ledger { reply } => {
                let _ = reply.send(self.core.ledger().blocks().to_vec());
            }
        }
    }

    /// Drain a batch of effects in order. `Execute` suspends the actor on
    /// the registry call; inbound events simply queue up behind it.
    async fn run_effects(&mut self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Broadcast(envelope) => {
                    for link in self.links.values() {
                        link.send(envelope.clone());
                    }
                }
                Effect::Send { to, envelope } => match self.links.get(&to) {
                    Some(link) => link.send(envelope),
                    None => warn!(peer = to, "no link for outbound message"),
                },
                Effect::Execute(transaction) => {
                    let outcome = self.settle(transaction).await;
                    queue.extend(self.core.finish_transfer(outcome));
                    if let Some(done) = self.completion.take() {
                        let _ = done.send(Ok(outcome));
                    }
                }
            }
        }
    }

    /// Registry settlement inside the critical section: debit, then
    /// credit. The mutual-exclusion protocol guarantees no other node is
    /// settling concurrently.
    async fn settle(&mut self, transaction: Transaction) -> Outcome {
        match self
            .registry
            .debit(transaction.src, transaction.amount)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(amount = transaction.amount, "insufficient funds, aborting");
                return Outcome::Aborted;
            }
            Err(err) => {
                warn!(error = ?err, "debit failed, aborting");
                return Outcome::Aborted;
            }
        }
        if let Err(err) = self
            .registry
            .credit(transaction.dst, transaction.amount)
            .await
        {
            // the debit is already applied; record the transfer and let
            // the operator reconcile the registry
            error!(error = ?err, "credit failed after successful debit");
        }
        Outcome::Committed
    }

    async fn status(&mut self) -> Status {
        let balance = match self.registry.balance(self.core.node_id()).await {
            Ok(balance) => Some(balance),
            Err(err) => {
                warn!(error = ?err, "balance lookup failed");
                None
            }
        };
        Status {
            node_id: self.core.node_id(),
            clock: self.core.clock_now(),
            phase: match self.core.phase() {
                Phase::Idle => "idle",
                Phase::Requesting => "requesting",
                Phase::Held => "held",
            },
            balance,
            peers: self.core.peers().iter().copied().collect(),
            unreachable_peers: self
                .links
                .values()
                .filter(|link| link.is_unreachable())
                .map(PeerLink::peer)
                .collect(),
            queue: self
                .core
                .queue_snapshot()
                .into_iter()
                .map(|entry| QueueItem {
                    time: entry.key.time,
                    initiator: entry.key.initiator,
                    dst: entry.transaction.dst,
                    amount: entry.transaction.amount,
                })
                .collect(),
            ledger_len: self.core.ledger().len(),
            ledger_head: hex(&self.core.ledger().head().hash),
            halted: self.core.halted(),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    use fmt::Write;
    bytes.iter().fold(String::new(), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

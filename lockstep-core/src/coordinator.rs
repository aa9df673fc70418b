//! The mutual-exclusion coordinator.
//!
//! [`CoordinatorCore`] is a pure state machine: it owns the clock, the
//! request queue, the single outstanding local request and the ledger,
//! consumes typed inputs, and returns [`Effect`]s for the shell to
//! execute. No I/O happens here, which is what lets the full protocol be
//! driven deterministically in tests.
//!
//! The shell contract around the critical section: when a transition
//! yields [`Effect::Execute`], settle the transaction against the account
//! registry and report back through
//! [`finish_transfer`](CoordinatorCore::finish_transfer), which appends
//! the block (on commit) and produces the release broadcast.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, trace, warn};

use crate::NodeId;
use crate::clock::LamportClock;
use crate::ledger::Ledger;
use crate::message::{Envelope, Outcome, PeerMessage, RequestKey, Transaction, Transfer};
use crate::queue::{Origin, QueueEntry, RequestQueue};

/// Outbound work produced by a state transition.
///
/// Effects are stamped (clock-wise) at the transition but transmitted by
/// the shell afterwards, outside the serialization point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send to every peer.
    Broadcast(Envelope),
    /// Send to a single peer.
    Send { to: NodeId, envelope: Envelope },
    /// The critical section is ours: settle `Transaction` against the
    /// registry, then call `finish_transfer` with the outcome.
    Execute(Transaction),
}

/// Why a transfer was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// A transfer from this node is already in flight.
    Busy,
    /// The destination is not a registered peer.
    UnknownPeer(NodeId),
    /// Transfers to oneself are rejected.
    SelfTransfer,
    /// Zero-amount transfers are rejected.
    ZeroAmount,
    /// The ledger diverged; this node no longer accepts transfers.
    Halted,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => f.write_str("a transfer is already in flight"),
            Self::UnknownPeer(id) => write!(f, "unknown peer {id}"),
            Self::SelfTransfer => f.write_str("cannot transfer to self"),
            Self::ZeroAmount => f.write_str("amount must be positive"),
            Self::Halted => f.write_str("node halted after ledger divergence"),
        }
    }
}

impl std::error::Error for TransferError {}

/// Coordinator phase, as seen by the operator surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Requesting,
    Held,
}

/// The local node's outstanding request and its reply bookkeeping.
#[derive(Debug, Clone)]
struct SelfRequest {
    key: RequestKey,
    transaction: Transaction,
    replies: BTreeSet<NodeId>,
}

pub struct CoordinatorCore {
    node_id: NodeId,
    peers: BTreeSet<NodeId>,
    clock: LamportClock,
    queue: RequestQueue,
    pending: Option<SelfRequest>,
    held: bool,
    ledger: Ledger,
    halted: bool,
}

impl CoordinatorCore {
    pub fn new(node_id: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Self {
        let peers = peers.into_iter().filter(|peer| *peer != node_id).collect();
        Self {
            node_id,
            peers,
            clock: LamportClock::new(),
            queue: RequestQueue::new(),
            pending: None,
            held: false,
            ledger: Ledger::new(),
            halted: false,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn peers(&self) -> &BTreeSet<NodeId> {
        &self.peers
    }

    #[must_use]
    pub fn clock_now(&self) -> u64 {
        self.clock.now()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.held {
            Phase::Held
        } else if self.pending.is_some() {
            Phase::Requesting
        } else {
            Phase::Idle
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[must_use]
    pub fn queue_snapshot(&self) -> Vec<QueueEntry> {
        self.queue.snapshot()
    }

    #[must_use]
    pub fn halted(&self) -> bool {
        self.halted
    }

    /// Start a transfer. Returns the effects to run: the request
    /// broadcast, plus immediate execution when no peer needs asking.
    ///
    /// # Errors
    ///
    /// Fails fast without touching protocol state; see [`TransferError`].
    pub fn begin_transfer(&mut self, transfer: Transfer) -> Result<Vec<Effect>, TransferError> {
        if self.halted {
            return Err(TransferError::Halted);
        }
        if self.pending.is_some() || self.held {
            return Err(TransferError::Busy);
        }
        if transfer.dst == self.node_id {
            return Err(TransferError::SelfTransfer);
        }
        if !self.peers.contains(&transfer.dst) {
            return Err(TransferError::UnknownPeer(transfer.dst));
        }
        if transfer.amount == 0 {
            return Err(TransferError::ZeroAmount);
        }

        let time = self.clock.tick_send();
        let key = RequestKey::new(time, self.node_id);
        let transaction = Transaction {
            src: self.node_id,
            dst: transfer.dst,
            amount: transfer.amount,
            ts: time,
            initiator: self.node_id,
        };
        self.queue.insert(QueueEntry {
            key,
            transaction,
            origin: Origin::Local,
        });
        self.pending = Some(SelfRequest {
            key,
            transaction,
            replies: BTreeSet::new(),
        });
        debug!(?key, dst = transfer.dst, amount = transfer.amount, "requesting entry");

        let mut effects = vec![Effect::Broadcast(Envelope {
            sender: self.node_id,
            send_ts: time,
            message: PeerMessage::Request { key, transfer },
        })];
        effects.extend(self.try_grant());
        Ok(effects)
    }

    /// Handle one inbound peer message. The clock folds in the envelope's
    /// own send timestamp before anything else — uniformly for all three
    /// message kinds, so a release never re-applies the original request
    /// timestamp.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> Vec<Effect> {
        self.clock.tick_recv(envelope.send_ts);
        match envelope.message {
            PeerMessage::Request { key, transfer } => {
                self.on_request(envelope.sender, key, transfer)
            }
            PeerMessage::Reply { in_reply_to } => self.on_reply(envelope.sender, in_reply_to),
            PeerMessage::Release {
                key,
                outcome,
                transaction,
            } => self.on_release(envelope.sender, key, outcome, transaction),
        }
    }

    /// Called by the shell once the registry settled the executing
    /// transfer. Appends the block on commit, then releases.
    pub fn finish_transfer(&mut self, outcome: Outcome) -> Vec<Effect> {
        if !self.held {
            warn!("finish_transfer outside the critical section");
            return Vec::new();
        }
        self.held = false;
        let Some(request) = self.pending.take() else {
            warn!("critical section held with no request slot");
            return Vec::new();
        };

        self.queue.remove(&request.key);
        if outcome == Outcome::Committed {
            self.append_block(request.transaction);
        }
        let send_ts = self.clock.tick_send();
        debug!(key = ?request.key, ?outcome, "releasing");
        vec![Effect::Broadcast(Envelope {
            sender: self.node_id,
            send_ts,
            message: PeerMessage::Release {
                key: request.key,
                outcome,
                transaction: request.transaction,
            },
        })]
    }

    fn on_request(&mut self, sender: NodeId, key: RequestKey, transfer: Transfer) -> Vec<Effect> {
        let transaction = Transaction {
            src: key.initiator,
            dst: transfer.dst,
            amount: transfer.amount,
            ts: key.time,
            initiator: key.initiator,
        };
        let inserted = self.queue.insert(QueueEntry {
            key,
            transaction,
            origin: Origin::Remote,
        });
        if !inserted {
            trace!(?key, "duplicate request, acknowledging again");
        }

        // The reply is unconditional: ordering comes from the queue.
        let send_ts = self.clock.tick_send();
        vec![Effect::Send {
            to: sender,
            envelope: Envelope {
                sender: self.node_id,
                send_ts,
                message: PeerMessage::Reply { in_reply_to: key },
            },
        }]
    }

    fn on_reply(&mut self, sender: NodeId, in_reply_to: RequestKey) -> Vec<Effect> {
        let Some(request) = &mut self.pending else {
            trace!(from = sender, "reply with no request outstanding");
            return Vec::new();
        };
        if request.key != in_reply_to {
            trace!(from = sender, ?in_reply_to, "reply for a stale request");
            return Vec::new();
        }
        if !request.replies.insert(sender) {
            trace!(from = sender, "duplicate reply");
        }
        self.try_grant()
    }

    fn on_release(
        &mut self,
        sender: NodeId,
        key: RequestKey,
        outcome: Outcome,
        transaction: Transaction,
    ) -> Vec<Effect> {
        if self.queue.remove(&key).is_none() {
            trace!(?key, from = sender, "release for an absent request");
        }
        debug!(?key, ?outcome, from = sender, "peer released");
        if outcome == Outcome::Committed {
            self.append_block(transaction);
        }
        self.try_grant()
    }

    /// Entry is granted when every peer has replied to the outstanding
    /// request and its key is the queue minimum.
    fn try_grant(&mut self) -> Vec<Effect> {
        if self.held {
            return Vec::new();
        }
        let Some(request) = &self.pending else {
            return Vec::new();
        };
        let all_replied = self.peers.iter().all(|peer| request.replies.contains(peer));
        let at_head = self
            .queue
            .peek_min()
            .is_some_and(|entry| entry.key == request.key);
        if !(all_replied && at_head) {
            return Vec::new();
        }

        self.held = true;
        debug!(key = ?request.key, "entering critical section");
        vec![Effect::Execute(request.transaction)]
    }

    fn append_block(&mut self, transaction: Transaction) {
        if self.halted {
            return;
        }
        match self.ledger.append(transaction) {
            Ok(block) => debug!(index = block.index, "appended block"),
            Err(err) => {
                warn!(%err, "ledger diverged, refusing new transfers");
                self.halted = true;
            }
        }
    }
}

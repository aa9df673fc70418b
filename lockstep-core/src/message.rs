//! Wire types: the peer-to-peer protocol messages and the registry RPC.

use serde::{Deserialize, Serialize};

use crate::{Amount, LamportTime, NodeId};

/// Total-order key for pending requests.
///
/// Compared lexicographically: timestamp first, initiator id breaking
/// ties. A node never reuses a `(time, self)` pair because the clock
/// advances on every emitted request, so keys are globally unique.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RequestKey {
    pub time: LamportTime,
    pub initiator: NodeId,
}

impl RequestKey {
    #[must_use]
    pub fn new(time: LamportTime, initiator: NodeId) -> Self {
        Self { time, initiator }
    }
}

/// What a transfer request asks for: move `amount` to `dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub dst: NodeId,
    pub amount: Amount,
}

/// An ordered transfer as it appears in the ledger. `initiator == src`
/// always; `ts` is the timestamp of the originating request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub src: NodeId,
    pub dst: NodeId,
    pub amount: Amount,
    pub ts: LamportTime,
    pub initiator: NodeId,
}

/// How a critical section ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The registry settled the transfer; a block was appended.
    Committed,
    /// The debit was rejected; no block exists for this request.
    Aborted,
}

/// Peer-to-peer protocol messages.
///
/// All three are fire-and-forget and idempotent by key, so the transport
/// may retry them freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Ask every peer for permission to execute `transfer`. The payload
    /// rides along so replicas can reconstruct the block without a
    /// separate channel; execution is still gated on replies and queue
    /// position.
    Request { key: RequestKey, transfer: Transfer },
    /// Unconditional acknowledgement of a request. Never withheld —
    /// ordering is enforced by the queue, not by delaying replies.
    Reply { in_reply_to: RequestKey },
    /// The initiator is done with `key`. Carries the transaction verbatim
    /// so every replica appends an identical block on commit.
    Release {
        key: RequestKey,
        outcome: Outcome,
        transaction: Transaction,
    },
}

/// Wire envelope: every message carries its sender and its own send
/// timestamp, which is what the receiver's clock folds in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: NodeId,
    pub send_ts: LamportTime,
    pub message: PeerMessage,
}

/// One peer as returned by the registry at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub endpoint: String,
}

/// North-bound requests to the account registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryRequest {
    /// Join the cluster. Answered only once every expected node has
    /// registered, with the complete peer directory.
    Register { endpoint: String },
    /// Atomic check-and-subtract against `node`'s balance.
    Debit { node: NodeId, amount: Amount },
    Credit { node: NodeId, amount: Amount },
    Balance { node: NodeId },
}

/// Registry responses, one per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryResponse {
    Registered {
        node_id: NodeId,
        initial_balance: Amount,
        peers: Vec<PeerInfo>,
    },
    DebitOk,
    /// The debit would overdraw the account; nothing was changed.
    Insufficient,
    CreditOk,
    Balance(Amount),
    UnknownNode,
    /// Registration arrived after the cluster was already complete.
    /// Membership is fixed once every expected node has joined.
    RegistrationClosed,
}

//! The hash-chained ledger of executed transfers.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::message::Transaction;

/// SHA-256 digest of a block.
pub type BlockHash = [u8; 32];

/// Width of [`canonical_bytes`] output.
pub const CANONICAL_TX_LEN: usize = 28;

/// Canonical fixed-width big-endian encoding of a transaction:
/// `src (4) ‖ dst (4) ‖ amount (8) ‖ ts (8) ‖ initiator (4)`.
///
/// This is the one surface that must agree bit-for-bit across replicas;
/// everything else about block hashing derives from it.
#[must_use]
pub fn canonical_bytes(tx: &Transaction) -> [u8; CANONICAL_TX_LEN] {
    let mut out = [0u8; CANONICAL_TX_LEN];
    out[0..4].copy_from_slice(&tx.src.to_be_bytes());
    out[4..8].copy_from_slice(&tx.dst.to_be_bytes());
    out[8..16].copy_from_slice(&tx.amount.to_be_bytes());
    out[16..24].copy_from_slice(&tx.ts.to_be_bytes());
    out[24..28].copy_from_slice(&tx.initiator.to_be_bytes());
    out
}

fn block_hash(index: u64, tx: &Transaction, prev_hash: &BlockHash) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(index.to_be_bytes());
    hasher.update(canonical_bytes(tx));
    hasher.update(prev_hash);
    hasher.finalize().into()
}

/// One ledger entry. `hash` covers the index, the canonical transaction
/// and `prev_hash`, so any mutation of an earlier block is detectable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub transaction: Transaction,
    pub prev_hash: BlockHash,
    pub hash: BlockHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    /// Appending at `index` would break the `(ts, initiator)` ordering of
    /// the chain.
    OutOfOrder { index: u64 },
    /// The block at `index` fails hash verification.
    Broken { index: u64 },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrder { index } => {
                write!(f, "block {index} would violate ledger ordering")
            }
            Self::Broken { index } => write!(f, "hash chain broken at block {index}"),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Append-only sequence of blocks starting at genesis.
///
/// Appends happen only inside the critical section, which is what makes
/// the chain identical across replicas.
#[derive(Debug, Clone)]
pub struct Ledger {
    blocks: Vec<Block>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// A chain holding only the genesis block: index 0, all-zero sentinel
    /// transaction, all-zero previous hash.
    #[must_use]
    pub fn new() -> Self {
        let transaction = Transaction::default();
        let prev_hash = [0u8; 32];
        let hash = block_hash(0, &transaction, &prev_hash);
        Self {
            blocks: vec![Block {
                index: 0,
                transaction,
                prev_hash,
                hash,
            }],
        }
    }

    /// Append the next block for `transaction`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::OutOfOrder`] when the transaction's
    /// `(ts, initiator)` key is not strictly greater than the head's —
    /// with honest peers that never happens, and the caller must treat it
    /// as divergence.
    pub fn append(&mut self, transaction: Transaction) -> Result<&Block, LedgerError> {
        let head = self.head();
        let index = head.index + 1;
        if head.index > 0 {
            let head_key = (head.transaction.ts, head.transaction.initiator);
            if (transaction.ts, transaction.initiator) <= head_key {
                return Err(LedgerError::OutOfOrder { index });
            }
        }
        let prev_hash = head.hash;
        let hash = block_hash(index, &transaction, &prev_hash);
        self.blocks.push(Block {
            index,
            transaction,
            prev_hash,
            hash,
        });
        Ok(&self.blocks[self.blocks.len() - 1])
    }

    /// Recompute every hash and link.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Broken`] with the first index that fails.
    pub fn verify(&self) -> Result<(), LedgerError> {
        let mut prev: BlockHash = [0u8; 32];
        for block in &self.blocks {
            let recomputed = block_hash(block.index, &block.transaction, &block.prev_hash);
            if block.prev_hash != prev || block.hash != recomputed {
                return Err(LedgerError::Broken { index: block.index });
            }
            prev = block.hash;
        }
        Ok(())
    }

    /// The most recent block. The chain is never empty.
    #[must_use]
    pub fn head(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Blocks with `lo <= index < hi`, clamped to the chain.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // both bounds are clamped to len
    pub fn range(&self, lo: u64, hi: u64) -> &[Block] {
        let len = self.blocks.len() as u64;
        let lo = lo.min(len) as usize;
        let hi = hi.clamp(lo as u64, len) as usize;
        &self.blocks[lo..hi]
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(src: u32, dst: u32, amount: u64, ts: u64) -> Transaction {
        Transaction {
            src,
            dst,
            amount,
            ts,
            initiator: src,
        }
    }

    #[test]
    fn genesis_links_from_zero() {
        let ledger = Ledger::new();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.head().index, 0);
        assert_eq!(ledger.head().prev_hash, [0u8; 32]);
        assert!(ledger.verify().is_ok());
    }

    #[test]
    fn append_chains_hashes() {
        let mut ledger = Ledger::new();
        let first = ledger.append(tx(1, 2, 10, 1)).unwrap().clone();
        assert_eq!(first.index, 1);
        let second = ledger.append(tx(2, 1, 5, 3)).unwrap().clone();
        assert_eq!(second.prev_hash, first.hash);
        assert!(ledger.verify().is_ok());
    }

    #[test]
    fn canonical_encoding_is_stable() {
        let transaction = tx(1, 2, 10, 7);
        assert_eq!(canonical_bytes(&transaction), canonical_bytes(&transaction));

        let mut a = Ledger::new();
        let mut b = Ledger::new();
        let hash_a = a.append(transaction).unwrap().hash;
        let hash_b = b.append(transaction).unwrap().hash;
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn rejects_out_of_order_appends() {
        let mut ledger = Ledger::new();
        ledger.append(tx(1, 2, 10, 5)).unwrap();
        // earlier timestamp
        assert_eq!(
            ledger.append(tx(2, 1, 5, 4)),
            Err(LedgerError::OutOfOrder { index: 2 })
        );
        // identical key
        assert_eq!(
            ledger.append(tx(1, 2, 5, 5)),
            Err(LedgerError::OutOfOrder { index: 2 })
        );
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn verify_detects_tampering() {
        let mut ledger = Ledger::new();
        ledger.append(tx(1, 2, 10, 1)).unwrap();
        ledger.append(tx(3, 2, 7, 2)).unwrap();
        assert!(ledger.verify().is_ok());

        ledger.blocks[1].transaction.amount = 1_000;
        assert_eq!(ledger.verify(), Err(LedgerError::Broken { index: 1 }));
    }

    #[test]
    fn any_prefix_verifies() {
        let mut ledger = Ledger::new();
        ledger.append(tx(1, 2, 10, 1)).unwrap();
        ledger.append(tx(3, 2, 7, 2)).unwrap();
        ledger.append(tx(2, 1, 4, 5)).unwrap();

        for len in 1..=ledger.len() {
            let prefix = Ledger {
                blocks: ledger.blocks[..len].to_vec(),
            };
            assert!(prefix.verify().is_ok(), "prefix of length {len}");
        }
    }

    #[test]
    fn range_clamps() {
        let mut ledger = Ledger::new();
        ledger.append(tx(1, 2, 10, 1)).unwrap();
        ledger.append(tx(3, 2, 7, 2)).unwrap();

        assert_eq!(ledger.range(1, 3).len(), 2);
        assert_eq!(ledger.range(0, 100).len(), 3);
        assert!(ledger.range(5, 2).is_empty());
    }
}

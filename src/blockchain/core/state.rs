use crate::crypto::Address;
use crate::transaction::Transaction;
use num_bigint::BigInt;
use num_traits::Zero;
use std::collections::HashMap;

use super::block::{Block, Sha256Hash};

/// What the engine remembers about every known block without reading it back
/// from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    pub height: u64,
    pub previous_hash: Sha256Hash,
    pub timestamp: u64,
    pub difficulty: u64,
}

impl From<&Block> for BlockMeta {
    fn from(block: &Block) -> Self {
        Self {
            height: block.height,
            previous_hash: block.previous_hash,
            timestamp: block.timestamp,
            difficulty: block.difficulty,
        }
    }
}

/// Engine-owned consensus state. The block store is the source of truth;
/// everything here can be rebuilt from it.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    /// `hashes[height]` is the canonical block at that height.
    pub hashes: Vec<Sha256Hash>,
    /// previous hash -> every known child.
    pub forks: HashMap<Sha256Hash, Vec<Sha256Hash>>,
    pub index: HashMap<Sha256Hash, BlockMeta>,
    /// Balances along the canonical chain only.
    pub balances: HashMap<Address, BigInt>,
}

impl LedgerState {
    pub fn new(genesis: &Block) -> Self {
        let mut state = Self::default();
        state.index.insert(genesis.hash, BlockMeta::from(genesis));
        state.hashes.push(genesis.hash);
        state
    }

    /// Record a block in the fork map. Returns false if it was already known.
    pub fn register(&mut self, block: &Block) -> bool {
        if self.index.contains_key(&block.hash) {
            return false;
        }
        self.index.insert(block.hash, BlockMeta::from(block));
        self.forks.entry(block.previous_hash).or_default().push(block.hash);
        true
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn meta(&self, hash: &Sha256Hash) -> Option<&BlockMeta> {
        self.index.get(hash)
    }

    pub fn children(&self, hash: &Sha256Hash) -> &[Sha256Hash] {
        self.forks.get(hash).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tip_hash(&self) -> Sha256Hash {
        self.hashes.last().copied().unwrap_or_default()
    }

    pub fn height(&self) -> u64 {
        self.hashes.len().saturating_sub(1) as u64
    }

    pub fn canonical_at(&self, height: u64) -> Option<Sha256Hash> {
        self.hashes.get(height as usize).copied()
    }

    pub fn is_canonical(&self, hash: &Sha256Hash) -> bool {
        self.meta(hash)
            .and_then(|meta| self.canonical_at(meta.height))
            .map_or(false, |canonical| &canonical == hash)
    }

    pub fn balance(&self, address: &Address) -> BigInt {
        self.balances.get(address).cloned().unwrap_or_default()
    }

    pub fn apply_block(&mut self, block: &Block, precision: usize) {
        for (address, delta) in block_deltas(&block.transactions, precision) {
            self.adjust(address, delta);
        }
    }

    pub fn revert_block(&mut self, block: &Block, precision: usize) {
        for (address, delta) in block_deltas(&block.transactions, precision) {
            self.adjust(address, -delta);
        }
    }

    fn adjust(&mut self, address: Address, delta: BigInt) {
        let entry = self.balances.entry(address).or_default();
        *entry += delta;
        if entry.is_zero() {
            self.balances.remove(&address);
        }
    }
}

/// Balance changes a list of transactions causes: senders are debited amount
/// plus fee, recipients credited the amount. The coinbase only credits.
pub fn block_deltas(transactions: &[Transaction], precision: usize) -> Vec<(Address, BigInt)> {
    let mut deltas = Vec::with_capacity(transactions.len() * 2);
    for tx in transactions {
        if let Some(sender) = tx.sender() {
            deltas.push((sender, -tx.spend(precision)));
        }
        if let Some(recipient) = tx.recipient() {
            deltas.push((recipient, tx.amount_value(precision)));
        }
    }
    deltas
}

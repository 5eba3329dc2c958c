use crate::codec;
use crate::config::ConsensusConfig;
use crate::crypto::Address;
use crate::error::ChainError;
use crate::mempool::{FeeRate, Mempool};
use crate::persistence::BlockStore;
use crate::transaction::Transaction;
use num_bigint::{BigInt, BigUint};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, error, info};

use super::block::{block_work, get_block_difficulty, Block, Sha256Hash};
use super::state::{block_deltas, LedgerState};
use super::validation::{is_part_of_chain_valid, spends_by_sender, LinkInvalid};

/// Why `add_block` refused a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddBlockError {
    AlreadyKnown,
    TimestampNotAfterParent,
    ChainInvalid(LinkInvalid),
    Persistence,
    UnknownParent,
}

impl AddBlockError {
    pub fn code(&self) -> u16 {
        match self {
            AddBlockError::AlreadyKnown => 1,
            AddBlockError::TimestampNotAfterParent => 2,
            AddBlockError::ChainInvalid(_) => 3,
            AddBlockError::Persistence => 4,
            AddBlockError::UnknownParent => 10,
        }
    }
}

impl fmt::Display for AddBlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddBlockError::ChainInvalid(inner) => write!(f, "{}.{}", self.code(), inner),
            _ => write!(f, "{}", self.code()),
        }
    }
}

impl std::error::Error for AddBlockError {}

/// Why `add_transaction` refused a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddTxError {
    Duplicate = 1,
    Stale = 2,
    InsufficientBalance = 3,
    FeeTooLow = 4,
}

impl AddTxError {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for AddTxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::error::Error for AddTxError {}

/// The chain-state engine: fork tracking, canonical selection by cumulative
/// work, the balance cache and the pending pool.
///
/// All mutation goes through `add_block`/`add_transaction`/`get_new_block`;
/// the owner is expected to serialize those calls.
pub struct Chain {
    consensus: ConsensusConfig,
    store: Box<dyn BlockStore>,
    genesis: Block,
    state: LedgerState,
    mempool: Mempool,
    fee_floor: FeeRate,
}

impl Chain {
    /// Build the genesis block, stream the store into the fork map and
    /// canonicalize from genesis.
    pub fn new(consensus: ConsensusConfig, store: Box<dyn BlockStore>) -> Result<Self, ChainError> {
        let genesis = Block::genesis(&consensus)?;
        let state = LedgerState::new(&genesis);
        let fee_floor = FeeRate::floor(consensus.min_fee_per_byte);

        let mut chain = Chain {
            consensus,
            store,
            genesis,
            state,
            mempool: Mempool::new(),
            fee_floor,
        };
        chain.load()?;
        Ok(chain)
    }

    fn load(&mut self) -> Result<(), ChainError> {
        let mut loaded = 0usize;
        for block in self.store.blocks()? {
            if block.hash == self.genesis.hash {
                continue;
            }
            if self.state.register(&block) {
                loaded += 1;
            }
        }
        let genesis = self.genesis.hash;
        self.canonicalize(genesis)?;
        info!(blocks = loaded, height = self.height(), tip = %hex::encode(self.tip()), "Chain loaded from store");
        Ok(())
    }

    pub fn consensus(&self) -> &ConsensusConfig {
        &self.consensus
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    pub fn tip(&self) -> Sha256Hash {
        self.state.tip_hash()
    }

    pub fn tip_block(&self) -> Result<Block, ChainError> {
        self.fetch(&self.tip())
    }

    pub fn height(&self) -> u64 {
        self.state.height()
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.state.contains(hash)
    }

    pub fn get_block(&self, hash: &Sha256Hash) -> Result<Option<Block>, ChainError> {
        if *hash == self.genesis.hash {
            return Ok(Some(self.genesis.clone()));
        }
        if !self.state.contains(hash) {
            return Ok(None);
        }
        self.store.get_block(hash)
    }

    /// Canonical block at `height`.
    pub fn get_block_at(&self, height: u64) -> Result<Option<Block>, ChainError> {
        match self.state.canonical_at(height) {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    /// Up to `count` consecutive canonical blocks starting at `height`.
    pub fn blocks_from(&self, height: u64, count: u64) -> Result<Vec<Block>, ChainError> {
        let mut blocks = Vec::new();
        for h in height..height.saturating_add(count) {
            match self.get_block_at(h)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    pub fn balance(&self, address: &Address) -> BigInt {
        self.state.balance(address)
    }

    pub fn balances(&self) -> &HashMap<Address, BigInt> {
        &self.state.balances
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.mempool.iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.mempool.len()
    }

    pub fn is_pending(&self, hash: &Sha256Hash) -> bool {
        self.mempool.contains(hash)
    }

    pub fn fee_floor(&self) -> &FeeRate {
        &self.fee_floor
    }

    fn fetch(&self, hash: &Sha256Hash) -> Result<Block, ChainError> {
        self.get_block(hash)?
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(hash)))
    }

    fn trusted_ancestor(&self, height: u64) -> Sha256Hash {
        self.state
            .canonical_at(height.saturating_sub(self.consensus.trust_depth))
            .unwrap_or(self.genesis.hash)
    }

    /// Balances as of `tip` inclusive, replayed from the store. With
    /// `only`, addresses outside the set are skipped.
    pub fn replay_balances(
        &self,
        tip: &Sha256Hash,
        only: Option<&HashSet<Address>>,
    ) -> Result<HashMap<Address, BigInt>, ChainError> {
        let precision = self.consensus.precision;
        let mut balances: HashMap<Address, BigInt> = HashMap::new();
        let mut cursor = self.fetch(tip)?;
        loop {
            for (address, delta) in block_deltas(&cursor.transactions, precision) {
                if only.map_or(true, |set| set.contains(&address)) {
                    *balances.entry(address).or_default() += delta;
                }
            }
            if cursor.is_genesis() {
                break;
            }
            cursor = self.fetch(&cursor.previous_hash)?;
        }
        balances.retain(|_, v| *v != BigInt::default());
        Ok(balances)
    }

    /// Re-select the canonical chain among every branch descending from
    /// `from`. Returns true when the tip moved.
    pub fn canonicalize(&mut self, from: Sha256Hash) -> Result<bool, ChainError> {
        let smoothness = self.consensus.smoothness;
        let precision = self.consensus.precision;

        // Depth-first in arrival order, so among equal-work branches the one
        // discovered first wins. The current tip is only displaced by a
        // branch with strictly more work.
        let old_tip = self.state.tip_hash();
        let mut best: (Sha256Hash, BigUint) = (from, BigUint::default());
        let mut tip_work: Option<BigUint> = None;
        let mut stack: Vec<(Sha256Hash, BigUint)> = vec![(from, BigUint::default())];
        while let Some((hash, work)) = stack.pop() {
            if work > best.1 {
                best = (hash, work.clone());
            }
            if hash == old_tip {
                tip_work = Some(work.clone());
            }
            for child in self.state.children(&hash).iter().rev() {
                let Some(meta) = self.state.meta(child) else { continue };
                stack.push((*child, &work + block_work(meta.difficulty, smoothness)));
            }
        }
        if tip_work.map_or(false, |work| work >= best.1) {
            best.0 = old_tip;
        }

        let new_tip = best.0;
        if new_tip == old_tip {
            return Ok(false);
        }
        let new_height = self
            .state
            .meta(&new_tip)
            .map(|meta| meta.height)
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(new_tip)))?;

        // A heavier but shorter branch: drop the heights above it first.
        while self.state.height() > new_height {
            if let Some(stale) = self.state.hashes.pop() {
                let block = self.fetch(&stale)?;
                self.state.revert_block(&block, precision);
            }
        }

        let mut path = Vec::new();
        let mut cursor = new_tip;
        loop {
            let meta = *self
                .state
                .meta(&cursor)
                .ok_or_else(|| ChainError::BlockNotFound(hex::encode(cursor)))?;
            if self.state.canonical_at(meta.height) == Some(cursor) || meta.height == 0 {
                break;
            }
            path.push((meta.height, cursor));
            cursor = meta.previous_hash;
        }

        let mut included = HashSet::new();
        for (height, hash) in path.into_iter().rev() {
            let index = height as usize;
            if let Some(replaced) = self.state.hashes.get(index).copied() {
                let old = self.fetch(&replaced)?;
                self.state.revert_block(&old, precision);
                self.state.hashes[index] = hash;
            } else {
                self.state.hashes.push(hash);
            }
            let block = self.fetch(&hash)?;
            self.state.apply_block(&block, precision);
            included.extend(block.transactions.iter().map(Transaction::hash));
        }

        let before = self.mempool.len();
        self.mempool.retain(|tx| !included.contains(&tx.hash()));
        info!(
            height = self.state.height(),
            tip = %hex::encode(new_tip),
            evicted = before - self.mempool.len(),
            "Canonical tip moved"
        );
        Ok(true)
    }

    pub fn add_block(&mut self, block: Block, now_ms: u64) -> Result<(), AddBlockError> {
        if block.hash == self.genesis.hash || self.state.contains(&block.hash) {
            return Err(AddBlockError::AlreadyKnown);
        }

        let parent = if block.height == 1 {
            self.genesis.clone()
        } else {
            if !self.state.contains(&block.previous_hash) {
                return Err(AddBlockError::UnknownParent);
            }
            self.fetch(&block.previous_hash).map_err(|e| {
                error!("Failed to read parent {}: {}", hex::encode(block.previous_hash), e);
                AddBlockError::Persistence
            })?
        };

        if block.timestamp <= parent.timestamp {
            return Err(AddBlockError::TimestampNotAfterParent);
        }

        let link = if parent.hash == self.state.tip_hash() {
            is_part_of_chain_valid(&parent, &block, |a| self.state.balance(a), &self.consensus, now_ms)
        } else {
            let senders: HashSet<Address> = spends_by_sender(&block, self.consensus.precision).into_keys().collect();
            let replayed = self.replay_balances(&parent.hash, Some(&senders)).map_err(|e| {
                error!("Cold balance replay failed: {}", e);
                AddBlockError::Persistence
            })?;
            is_part_of_chain_valid(
                &parent,
                &block,
                |a| replayed.get(a).cloned().unwrap_or_default(),
                &self.consensus,
                now_ms,
            )
        };
        link.map_err(AddBlockError::ChainInvalid)?;

        self.store.put_block(&block).map_err(|e| {
            error!("Failed to persist block {}: {}", block.hash_str(), e);
            AddBlockError::Persistence
        })?;
        self.state.register(&block);
        debug!(height = block.height, hash = %block.hash_str(), "Block registered");

        let from = self.trusted_ancestor(block.height);
        self.canonicalize(from).map_err(|e| {
            error!("Canonicalization failed after {}: {}", block.hash_str(), e);
            AddBlockError::Persistence
        })?;
        Ok(())
    }

    pub fn add_transaction(&mut self, tx: Transaction) -> Result<(), AddTxError> {
        let precision = self.consensus.precision;
        let hash = tx.hash();
        if self.mempool.contains(&hash) {
            return Err(AddTxError::Duplicate);
        }

        let tip_timestamp = self.state.meta(&self.state.tip_hash()).map_or(0, |meta| meta.timestamp);
        if tx.timestamp.unwrap_or_default() < tip_timestamp {
            return Err(AddTxError::Stale);
        }

        let sender = tx.sender().ok_or(AddTxError::InsufficientBalance)?;
        let required = tx.spend(precision) + self.mempool.pending_spend(&sender, precision);
        if self.state.balance(&sender) < required {
            return Err(AddTxError::InsufficientBalance);
        }

        if FeeRate::of(&tx, precision) < self.fee_floor {
            return Err(AddTxError::FeeTooLow);
        }

        self.mempool.add_transaction(tx);
        Ok(())
    }

    /// Assemble an unmined block on top of the canonical tip.
    pub fn get_new_block(&mut self, reward_address: Address, now_ms: u64) -> Result<Block, ChainError> {
        let precision = self.consensus.precision;
        self.fee_floor = FeeRate::floor(self.consensus.min_fee_per_byte);

        let tip = self.tip_block()?;
        self.mempool.retain(|tx| tx.timestamp.unwrap_or_default() >= tip.timestamp);

        // Highest fee rate first, skipping what a sender can no longer cover
        // after a reorganization.
        let mut committed: HashMap<Address, BigInt> = HashMap::new();
        let mut selected: Vec<(FeeRate, Transaction)> = Vec::new();
        for (rate, tx) in self.mempool.get_transactions_by_fee(precision) {
            if tx.timestamp.unwrap_or_default() >= now_ms {
                continue;
            }
            let Some(sender) = tx.sender() else { continue };
            let spent = committed.entry(sender).or_default();
            let total = &*spent + tx.spend(precision);
            if total > self.state.balance(&sender) {
                continue;
            }
            *spent = total;
            selected.push((rate, tx));
        }

        let mut coinbase_amount = self.consensus.reward();
        for (_, tx) in &selected {
            coinbase_amount += tx.fee_value(precision);
        }
        let coinbase = Transaction::coinbase(reward_address.to_vec(), codec::canonicalize(&coinbase_amount, precision));

        let timestamp = now_ms.max(tip.timestamp + 1);
        let difficulty = get_block_difficulty(&tip, timestamp, &self.consensus);
        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(coinbase);
        transactions.extend(selected.iter().map(|(_, tx)| tx.clone()));
        let mut block = Block::new(tip.hash, tip.height + 1, timestamp, difficulty, transactions);

        let cap = self.consensus.max_block_size.saturating_sub(self.consensus.block_size_margin);
        while block.serialized_size() > cap && block.transactions.len() > 1 {
            let Some(dropped) = block.transactions.pop() else { break };
            selected.pop();
            coinbase_amount -= dropped.fee_value(precision);
            block.transactions[0].amount = Some(codec::canonicalize(&coinbase_amount, precision));
            if let Some((tail, _)) = selected.last() {
                if *tail > self.fee_floor {
                    self.fee_floor = tail.clone();
                }
            }
        }

        debug!(
            height = block.height,
            transactions = block.transactions.len() - 1,
            difficulty = block.difficulty,
            "Assembled block template"
        );
        Ok(block)
    }
}

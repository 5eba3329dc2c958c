use crate::codec::{self, MinifiedBlock};
use crate::config::ConsensusConfig;
use crate::crypto::ADDRESS_SIZE;
use crate::error::ChainError;
use crate::transaction::{Transaction, TxInvalid};
use argon2::{Algorithm, Argon2, Params, Version};
use num_bigint::{BigInt, BigUint};
use num_traits::One;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

pub type Sha256Hash = [u8; 32];

pub const ZERO_HASH: Sha256Hash = [0u8; 32];

const POW_SALT: &[u8] = b"cairnchain-pow";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub previous_hash: Sha256Hash,
    pub height: u64,
    pub timestamp: u64,
    pub difficulty: u64,
    pub nonce: u64,
    /// Index 0 is the coinbase.
    pub transactions: Vec<Transaction>,
    pub hash: Sha256Hash,
}

/// Why a block failed `is_valid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockInvalid {
    Structure,
    TimestampInFuture,
    TooLarge,
    HashMismatch,
    DifficultyNotMet,
    MissingCoinbase,
    CoinbaseShape,
    CoinbaseRecipient,
    CoinbaseAmount,
    Transaction(TxInvalid),
    DuplicateTransaction,
}

impl BlockInvalid {
    pub fn code(&self) -> u16 {
        match self {
            BlockInvalid::Structure => 1,
            BlockInvalid::TimestampInFuture => 2,
            BlockInvalid::TooLarge => 3,
            BlockInvalid::HashMismatch => 4,
            BlockInvalid::DifficultyNotMet => 5,
            BlockInvalid::MissingCoinbase => 6,
            BlockInvalid::CoinbaseShape => 7,
            BlockInvalid::CoinbaseRecipient => 8,
            BlockInvalid::CoinbaseAmount => 9,
            BlockInvalid::Transaction(_) => 10,
            BlockInvalid::DuplicateTransaction => 11,
        }
    }
}

impl fmt::Display for BlockInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockInvalid::Transaction(inner) => write!(f, "{}.{}", self.code(), inner),
            _ => write!(f, "{}", self.code()),
        }
    }
}

impl std::error::Error for BlockInvalid {}

/// 32 zero bytes except one bit, selected by `difficulty >> smoothness`.
/// A hash meets the difficulty when it is `<=` this buffer, big-endian.
pub fn target_buffer(difficulty: u64, smoothness: u32) -> Sha256Hash {
    let mut target = ZERO_HASH;
    let shift = difficulty >> smoothness;
    let index = (shift / 8) as usize;
    if index < target.len() {
        target[index] = 1u8 << (7 - (shift % 8));
    }
    target
}

pub fn hash_meets_target(hash: &Sha256Hash, target: &Sha256Hash) -> bool {
    // Byte arrays compare lexicographically, which is big-endian numeric order.
    hash <= target
}

/// Retarget over a two-block window: the parent and the timestamp of its child.
pub fn get_block_difficulty(prev: &Block, timestamp: u64, consensus: &ConsensusConfig) -> u64 {
    let gap = timestamp.saturating_sub(prev.timestamp);
    let target = consensus.target_block_time_ms;
    if gap.saturating_mul(3) < target.saturating_mul(2) {
        (prev.difficulty + consensus.quantum()).min(consensus.max_difficulty())
    } else if gap >= target {
        prev.difficulty
            .saturating_sub(consensus.quantum())
            .max(consensus.min_difficulty())
    } else {
        prev.difficulty
    }
}

/// Memory-hard proof-of-work digest of `header ‖ nonce`.
pub fn pow_digest(header: &Sha256Hash, nonce: u64, consensus: &ConsensusConfig) -> Result<Sha256Hash, ChainError> {
    let params = Params::new(consensus.pow_memory_kib, consensus.pow_passes, 1, Some(32))
        .map_err(|e| ChainError::CryptoError(format!("Invalid proof-of-work parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut input = Vec::with_capacity(40);
    input.extend_from_slice(header);
    input.extend_from_slice(&nonce.to_le_bytes());

    let mut out = ZERO_HASH;
    argon2
        .hash_password_into(&input, POW_SALT, &mut out)
        .map_err(|e| ChainError::CryptoError(format!("Proof-of-work hashing failed: {}", e)))?;
    Ok(out)
}

impl Block {
    /// Unmined block template; `hash` is filled in by the miner.
    pub fn new(previous_hash: Sha256Hash, height: u64, timestamp: u64, difficulty: u64, transactions: Vec<Transaction>) -> Self {
        Block {
            previous_hash,
            height,
            timestamp,
            difficulty,
            nonce: 0,
            transactions,
            hash: ZERO_HASH,
        }
    }

    /// Deterministic genesis block. It carries no transactions and its nonce
    /// is the first one meeting the base difficulty.
    pub fn genesis(consensus: &ConsensusConfig) -> Result<Self, ChainError> {
        let mut block = Block::new(
            ZERO_HASH,
            0,
            consensus.genesis_timestamp,
            consensus.min_difficulty(),
            Vec::new(),
        );
        let header = block.header();
        let target = target_buffer(block.difficulty, consensus.smoothness);
        loop {
            let hash = pow_digest(&header, block.nonce, consensus)?;
            if hash_meets_target(&hash, &target) {
                block.hash = hash;
                return Ok(block);
            }
            block.nonce += 1;
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    pub fn transactions_hash(&self) -> Sha256Hash {
        Sha256::digest(codec::minify_transactions(&self.transactions)).into()
    }

    /// sha256(previousHash ‖ timestamp ‖ transactionsHash ‖ height ‖ difficulty)
    pub fn header(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash);
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.transactions_hash());
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.difficulty.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn compute_hash(&self, consensus: &ConsensusConfig) -> Result<Sha256Hash, ChainError> {
        pow_digest(&self.header(), self.nonce, consensus)
    }

    pub fn target(&self, consensus: &ConsensusConfig) -> Sha256Hash {
        target_buffer(self.difficulty, consensus.smoothness)
    }

    pub fn meets_difficulty(&self, consensus: &ConsensusConfig) -> bool {
        hash_meets_target(&self.hash, &self.target(consensus))
    }

    /// Contribution to cumulative work: `2^(difficulty >> smoothness)`.
    pub fn work(&self, smoothness: u32) -> BigUint {
        block_work(self.difficulty, smoothness)
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn minify(&self) -> MinifiedBlock {
        MinifiedBlock::from_block(self)
    }

    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(&self.minify()).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    pub fn is_valid(&self, consensus: &ConsensusConfig, now_ms: u64) -> Result<(), BlockInvalid> {
        if self.difficulty % consensus.quantum() != 0
            || self.difficulty < consensus.min_difficulty()
            || self.difficulty > consensus.max_difficulty()
        {
            return Err(BlockInvalid::Structure);
        }
        if self.timestamp > now_ms.saturating_add(consensus.max_clock_desync_ms) {
            return Err(BlockInvalid::TimestampInFuture);
        }
        if self.serialized_size() > consensus.max_block_size {
            return Err(BlockInvalid::TooLarge);
        }
        match self.compute_hash(consensus) {
            Ok(hash) if hash == self.hash => {}
            _ => return Err(BlockInvalid::HashMismatch),
        }
        if !self.meets_difficulty(consensus) {
            return Err(BlockInvalid::DifficultyNotMet);
        }
        self.has_valid_transactions(consensus, now_ms)
    }

    pub fn has_valid_transactions(&self, consensus: &ConsensusConfig, now_ms: u64) -> Result<(), BlockInvalid> {
        let precision = consensus.precision;
        let (coinbase, rest) = self.transactions.split_first().ok_or(BlockInvalid::MissingCoinbase)?;

        if coinbase.from.is_some()
            || coinbase.signature.is_some()
            || coinbase.recovery_param.is_some()
            || coinbase.timestamp.is_some()
            || coinbase.miner_fee.is_some()
        {
            return Err(BlockInvalid::CoinbaseShape);
        }
        if coinbase.to.as_ref().map(Vec::len) != Some(ADDRESS_SIZE) {
            return Err(BlockInvalid::CoinbaseRecipient);
        }
        let coinbase_amount = match coinbase.amount.as_deref().and_then(|a| {
            codec::parse_amount(a, precision).filter(|v| codec::canonicalize(v, precision) == a)
        }) {
            Some(v) => v,
            None => return Err(BlockInvalid::CoinbaseRecipient),
        };

        let fees: BigInt = rest.iter().map(|tx| tx.fee_value(precision)).sum();
        if coinbase_amount != consensus.reward() + fees {
            return Err(BlockInvalid::CoinbaseAmount);
        }

        for tx in rest {
            tx.is_valid(consensus, now_ms).map_err(BlockInvalid::Transaction)?;
        }

        let mut seen = HashSet::with_capacity(self.transactions.len());
        if !self.transactions.iter().all(|tx| seen.insert(tx.hash())) {
            return Err(BlockInvalid::DuplicateTransaction);
        }
        Ok(())
    }

    /// `0` when valid, the rule's code otherwise.
    pub fn validity_code(&self, consensus: &ConsensusConfig, now_ms: u64) -> String {
        self.is_valid(consensus, now_ms).map_or_else(|e| e.to_string(), |_| "0".to_string())
    }
}

pub fn block_work(difficulty: u64, smoothness: u32) -> BigUint {
    BigUint::one() << ((difficulty >> smoothness) as usize)
}

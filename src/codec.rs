//! Fixed-point amounts and the versioned wire/storage schema.
//!
//! Amounts are carried as canonical decimal strings and handled in memory as
//! [`BigInt`]s scaled by `10^precision`. Entities are "minified" into short
//! field names before they hit the wire or the block store and "beautified"
//! back on the way in.

use crate::blockchain::{Block, Sha256Hash};
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use num_bigint::{BigInt, Sign};
use num_traits::Zero;
use serde::{Deserialize, Serialize};

pub const AMOUNT_SEPARATOR: char = '.';

/// Schema version of the minified field layout below.
pub const SCHEMA_VERSION: u32 = 1;

/// Parse a decimal amount into base units. Returns `None` for anything that
/// is not an integer once the separator is removed and the fraction padded.
pub fn parse_amount(s: &str, precision: usize) -> Option<BigInt> {
    let mut parts = s.split(AMOUNT_SEPARATOR);
    let integer = parts.next()?;
    let fraction = parts.next().unwrap_or("");
    if parts.next().is_some() || fraction.len() > precision {
        return None;
    }

    let mut digits = String::with_capacity(integer.len() + precision);
    digits.push_str(integer);
    digits.push_str(fraction);
    digits.extend(std::iter::repeat('0').take(precision - fraction.len()));

    let body = digits.strip_prefix('-').unwrap_or(&digits);
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<BigInt>().ok()
}

/// Render base units as the canonical decimal string: no trailing fraction
/// zeros and no dangling separator.
pub fn canonicalize(value: &BigInt, precision: usize) -> String {
    if value.is_zero() {
        return "0".to_string();
    }

    let mut digits = value.magnitude().to_string();
    if digits.len() <= precision {
        let padding = "0".repeat(precision + 1 - digits.len());
        digits.insert_str(0, &padding);
    }
    let (integer, fraction) = digits.split_at(digits.len() - precision);
    let fraction = fraction.trim_end_matches('0');

    let mut out = String::with_capacity(digits.len() + 2);
    if value.sign() == Sign::Minus {
        out.push('-');
    }
    out.push_str(integer);
    if !fraction.is_empty() {
        out.push(AMOUNT_SEPARATOR);
        out.push_str(fraction);
    }
    out
}

/// True when `s` parses and renders back to itself.
pub fn is_canonical(s: &str, precision: usize) -> bool {
    parse_amount(s, precision)
        .map(|v| canonicalize(&v, precision) == s)
        .unwrap_or(false)
}

pub fn decode_hash(s: &str) -> Result<Sha256Hash> {
    let bytes = hex::decode(s).map_err(|e| ChainError::CodecError(format!("Invalid hex hash: {}", e)))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ChainError::CodecError(format!("Hash must be 32 bytes, got {}", b.len())))
}

fn decode_bytes(field: &str, s: &Option<String>) -> Result<Option<Vec<u8>>> {
    s.as_deref()
        .map(|s| hex::decode(s).map_err(|e| ChainError::CodecError(format!("Invalid hex in {}: {}", field, e))))
        .transpose()
}

/// Minified transaction, schema v1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinifiedTransaction {
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub miner_fee: Option<String>,
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub recovery_param: Option<u8>,
}

impl From<&Transaction> for MinifiedTransaction {
    fn from(tx: &Transaction) -> Self {
        Self {
            from: tx.from.as_ref().map(hex::encode),
            to: tx.to.as_ref().map(hex::encode),
            amount: tx.amount.clone(),
            miner_fee: tx.miner_fee.clone(),
            timestamp: tx.timestamp,
            signature: tx.signature.as_ref().map(hex::encode),
            recovery_param: tx.recovery_param,
        }
    }
}

impl TryFrom<MinifiedTransaction> for Transaction {
    type Error = ChainError;

    fn try_from(min: MinifiedTransaction) -> Result<Self> {
        Ok(Transaction {
            from: decode_bytes("from", &min.from)?,
            to: decode_bytes("to", &min.to)?,
            amount: min.amount,
            miner_fee: min.miner_fee,
            timestamp: min.timestamp,
            signature: decode_bytes("signature", &min.signature)?,
            recovery_param: min.recovery_param,
        })
    }
}

/// Minified block, schema v1. `hash` travels on the wire but is the key,
/// not part of the value, in the block store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinifiedBlock {
    #[serde(rename = "p")]
    pub previous_hash: String,
    #[serde(rename = "h")]
    pub height: u64,
    #[serde(rename = "ts")]
    pub timestamp: u64,
    #[serde(rename = "d")]
    pub difficulty: u64,
    #[serde(rename = "n")]
    pub nonce: u64,
    #[serde(rename = "x")]
    pub transactions: Vec<MinifiedTransaction>,
    #[serde(rename = "k", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl MinifiedBlock {
    /// Wire shape, hash included.
    pub fn from_block(block: &Block) -> Self {
        let mut min = Self::for_storage(block);
        min.hash = Some(hex::encode(block.hash));
        min
    }

    /// Store shape, hash omitted.
    pub fn for_storage(block: &Block) -> Self {
        Self {
            previous_hash: hex::encode(block.previous_hash),
            height: block.height,
            timestamp: block.timestamp,
            difficulty: block.difficulty,
            nonce: block.nonce,
            transactions: block.transactions.iter().map(MinifiedTransaction::from).collect(),
            hash: None,
        }
    }

    /// Rebuild a stored block whose hash is the store key.
    pub fn into_block_with_hash(mut self, hash: Sha256Hash) -> Result<Block> {
        self.hash = Some(hex::encode(hash));
        Block::try_from(self)
    }
}

impl TryFrom<MinifiedBlock> for Block {
    type Error = ChainError;

    fn try_from(min: MinifiedBlock) -> Result<Self> {
        let hash = min
            .hash
            .as_deref()
            .ok_or_else(|| ChainError::CodecError("Block hash missing".to_string()))?;
        let transactions = min
            .transactions
            .into_iter()
            .map(Transaction::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Block {
            previous_hash: decode_hash(&min.previous_hash)?,
            height: min.height,
            timestamp: min.timestamp,
            difficulty: min.difficulty,
            nonce: min.nonce,
            transactions,
            hash: decode_hash(hash)?,
        })
    }
}

/// JSON of the minified transaction list; hashed into the block header.
pub fn minify_transactions(transactions: &[Transaction]) -> Vec<u8> {
    let list: Vec<MinifiedTransaction> = transactions.iter().map(MinifiedTransaction::from).collect();
    serde_json::to_vec(&list).unwrap_or_default()
}

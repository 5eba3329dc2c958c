/// Transaction types for CairnChain
use crate::blockchain::Sha256Hash;
use crate::codec::{self, MinifiedTransaction};
use crate::crypto::{Address, KeyPair, ADDRESS_SIZE};
use num_bigint::BigInt;
use sha2::{Digest, Sha256};

/// A value transfer, or the coinbase entry at index 0 of a block.
///
/// Byte fields are kept as received so that malformed input can be reported
/// with a precise validity code instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub from: Option<Vec<u8>>,
    pub to: Option<Vec<u8>>,
    /// Canonical decimal string.
    pub amount: Option<String>,
    /// Canonical decimal string.
    pub miner_fee: Option<String>,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: Option<u64>,
    pub signature: Option<Vec<u8>>,
    pub recovery_param: Option<u8>,
}

impl Transaction {
    pub fn new_transfer(
        from: Address,
        to: Address,
        amount: impl Into<String>,
        miner_fee: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Transaction {
            from: Some(from.to_vec()),
            to: Some(to.to_vec()),
            amount: Some(amount.into()),
            miner_fee: Some(miner_fee.into()),
            timestamp: Some(timestamp),
            signature: None,
            recovery_param: None,
        }
    }

    /// Fee-only transaction: no recipient, no amount.
    pub fn new_fee_only(from: Address, miner_fee: impl Into<String>, timestamp: u64) -> Self {
        Transaction {
            from: Some(from.to_vec()),
            to: None,
            amount: None,
            miner_fee: Some(miner_fee.into()),
            timestamp: Some(timestamp),
            signature: None,
            recovery_param: None,
        }
    }

    pub fn coinbase(to: Vec<u8>, amount: String) -> Self {
        Transaction {
            from: None,
            to: Some(to),
            amount: Some(amount),
            miner_fee: None,
            timestamp: None,
            signature: None,
            recovery_param: None,
        }
    }

    /// Identity hash: sha256(from ‖ to ‖ amount ‖ minerFee ‖ timestamp).
    /// This is also the digest that gets signed.
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        if let Some(from) = &self.from {
            hasher.update(from);
        }
        if let Some(to) = &self.to {
            hasher.update(to);
        }
        if let Some(amount) = &self.amount {
            hasher.update(amount.as_bytes());
        }
        if let Some(fee) = &self.miner_fee {
            hasher.update(fee.as_bytes());
        }
        if let Some(timestamp) = self.timestamp {
            hasher.update(timestamp.to_le_bytes());
        }
        hasher.finalize().into()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }

    pub fn sign(&mut self, keypair: &KeyPair) {
        let (signature, recovery_param) = keypair.sign_digest(&self.hash());
        self.signature = Some(signature.to_vec());
        self.recovery_param = Some(recovery_param);
    }

    pub fn is_coinbase(&self) -> bool {
        self.from.is_none()
    }

    pub fn sender(&self) -> Option<Address> {
        as_address(self.from.as_deref())
    }

    pub fn recipient(&self) -> Option<Address> {
        as_address(self.to.as_deref())
    }

    pub fn amount_value(&self, precision: usize) -> BigInt {
        parse_or_zero(self.amount.as_deref(), precision)
    }

    pub fn fee_value(&self, precision: usize) -> BigInt {
        parse_or_zero(self.miner_fee.as_deref(), precision)
    }

    /// What the sender is debited: amount plus fee.
    pub fn spend(&self, precision: usize) -> BigInt {
        self.amount_value(precision) + self.fee_value(precision)
    }

    pub fn minify(&self) -> MinifiedTransaction {
        MinifiedTransaction::from(self)
    }

    /// Size of the minified JSON encoding, the unit of fee-per-byte.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(&self.minify()).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

fn as_address(bytes: Option<&[u8]>) -> Option<Address> {
    bytes.filter(|b| b.len() == ADDRESS_SIZE).and_then(|b| b.try_into().ok())
}

fn parse_or_zero(s: Option<&str>, precision: usize) -> BigInt {
    s.and_then(|s| codec::parse_amount(s, precision)).unwrap_or_default()
}

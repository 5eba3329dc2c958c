//! Pending transaction pool and fee-rate ordering

use crate::blockchain::Sha256Hash;
use crate::crypto::Address;
use crate::transaction::Transaction;
use num_bigint::BigInt;
use std::cmp::Reverse;
use std::collections::HashMap;

/// Fee per serialized byte, kept as integer quotient and remainder so
/// comparisons are exact. Orders by quotient, then remainder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FeeRate {
    pub per_byte: BigInt,
    pub remainder: BigInt,
}

impl FeeRate {
    pub fn of(tx: &Transaction, precision: usize) -> Self {
        let size = BigInt::from(tx.serialized_size().max(1));
        let fee = tx.fee_value(precision);
        FeeRate {
            per_byte: &fee / &size,
            remainder: fee % size,
        }
    }

    /// The configured minimum, with no remainder.
    pub fn floor(min_per_byte: u64) -> Self {
        FeeRate {
            per_byte: BigInt::from(min_per_byte),
            remainder: BigInt::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mempool {
    transactions: HashMap<Sha256Hash, Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.transactions.contains_key(hash)
    }

    pub fn add_transaction(&mut self, tx: Transaction) -> bool {
        self.transactions.insert(tx.hash(), tx).is_none()
    }

    pub fn remove_transaction(&mut self, hash: &Sha256Hash) -> Option<Transaction> {
        self.transactions.remove(hash)
    }

    pub fn get_transaction(&self, hash: &Sha256Hash) -> Option<&Transaction> {
        self.transactions.get(hash)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Transaction) -> bool) {
        self.transactions.retain(|_, tx| keep(tx));
    }

    /// Total already committed by `sender` across pending transactions.
    pub fn pending_spend(&self, sender: &Address, precision: usize) -> BigInt {
        self.transactions
            .values()
            .filter(|tx| tx.sender().as_ref() == Some(sender))
            .map(|tx| tx.spend(precision))
            .sum()
    }

    /// Pending transactions, best fee rate first.
    pub fn get_transactions_by_fee(&self, precision: usize) -> Vec<(FeeRate, Transaction)> {
        let mut ranked: Vec<(FeeRate, Sha256Hash, Transaction)> = self
            .transactions
            .iter()
            .map(|(hash, tx)| (FeeRate::of(tx, precision), *hash, tx.clone()))
            .collect();
        ranked.sort_by(|a, b| (Reverse(&a.0), &a.1).cmp(&(Reverse(&b.0), &b.1)));
        ranked.into_iter().map(|(rate, _, tx)| (rate, tx)).collect()
    }
}

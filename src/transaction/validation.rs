/// Stateless validation rules for transactions
use crate::codec;
use crate::config::ConsensusConfig;
use crate::crypto::{self, ADDRESS_SIZE, SIGNATURE_SIZE};
use crate::transaction::types::Transaction;
use num_bigint::Sign;
use std::fmt;

/// Why a transaction failed `is_valid`. The discriminant is the stable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxInvalid {
    MalformedFrom = 1,
    ToAmountPairing = 2,
    MalformedTo = 3,
    NonCanonicalAmount = 4,
    NonPositiveAmount = 5,
    MissingSignature = 6,
    MissingMinerFee = 7,
    NonCanonicalMinerFee = 8,
    NegativeMinerFee = 9,
    RecoveryParamOutOfRange = 10,
    MissingTimestamp = 11,
    TimestampInFuture = 12,
    SelfTransfer = 13,
    MalformedSignature = 14,
    MissingRecoveryParam = 15,
    TooLarge = 16,
    SignatureVerification = 17,
}

impl TxInvalid {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use TxInvalid::*;
        [
            MalformedFrom,
            ToAmountPairing,
            MalformedTo,
            NonCanonicalAmount,
            NonPositiveAmount,
            MissingSignature,
            MissingMinerFee,
            NonCanonicalMinerFee,
            NegativeMinerFee,
            RecoveryParamOutOfRange,
            MissingTimestamp,
            TimestampInFuture,
            SelfTransfer,
            MalformedSignature,
            MissingRecoveryParam,
            TooLarge,
            SignatureVerification,
        ]
        .into_iter()
        .find(|r| r.code() == code)
    }
}

impl fmt::Display for TxInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::error::Error for TxInvalid {}

impl Transaction {
    /// Stateless checks: shape, canonical amounts, clock bound and signature.
    /// Does not look at balances; the chain engine does that on admission.
    pub fn is_valid(&self, consensus: &ConsensusConfig, now_ms: u64) -> Result<(), TxInvalid> {
        let precision = consensus.precision;

        let from = match self.from.as_deref() {
            Some(from) if from.len() == ADDRESS_SIZE => from,
            _ => return Err(TxInvalid::MalformedFrom),
        };

        if self.to.is_some() != self.amount.is_some() {
            return Err(TxInvalid::ToAmountPairing);
        }
        if let (Some(to), Some(amount)) = (self.to.as_deref(), self.amount.as_deref()) {
            if to.len() != ADDRESS_SIZE {
                return Err(TxInvalid::MalformedTo);
            }
            let value = match codec::parse_amount(amount, precision) {
                Some(v) if codec::canonicalize(&v, precision) == amount => v,
                _ => return Err(TxInvalid::NonCanonicalAmount),
            };
            if value.sign() != Sign::Plus {
                return Err(TxInvalid::NonPositiveAmount);
            }
            if to == from {
                return Err(TxInvalid::SelfTransfer);
            }
        }

        let signature = self.signature.as_deref().ok_or(TxInvalid::MissingSignature)?;

        let fee = self.miner_fee.as_deref().ok_or(TxInvalid::MissingMinerFee)?;
        let fee_value = match codec::parse_amount(fee, precision) {
            Some(v) if codec::canonicalize(&v, precision) == fee => v,
            _ => return Err(TxInvalid::NonCanonicalMinerFee),
        };
        if fee_value.sign() == Sign::Minus {
            return Err(TxInvalid::NegativeMinerFee);
        }

        let recovery_param = self.recovery_param.ok_or(TxInvalid::MissingRecoveryParam)?;
        if recovery_param > 3 {
            return Err(TxInvalid::RecoveryParamOutOfRange);
        }

        let timestamp = self.timestamp.ok_or(TxInvalid::MissingTimestamp)?;
        if timestamp > now_ms.saturating_add(consensus.max_clock_desync_ms) {
            return Err(TxInvalid::TimestampInFuture);
        }

        if self.serialized_size() > consensus.max_transaction_size {
            return Err(TxInvalid::TooLarge);
        }

        if signature.len() != SIGNATURE_SIZE {
            return Err(TxInvalid::MalformedSignature);
        }

        match crypto::recover_signer(&self.hash(), signature, recovery_param) {
            Ok(signer) if signer.as_slice() == from => Ok(()),
            _ => Err(TxInvalid::SignatureVerification),
        }
    }

    /// `0` when valid, the rule's code otherwise.
    pub fn validity_code(&self, consensus: &ConsensusConfig, now_ms: u64) -> u16 {
        self.is_valid(consensus, now_ms).map_or_else(TxInvalid::code, |_| 0)
    }
}

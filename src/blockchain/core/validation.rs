use crate::config::ConsensusConfig;
use crate::crypto::Address;
use num_bigint::BigInt;
use std::collections::HashMap;
use std::fmt;

use super::block::{get_block_difficulty, Block, BlockInvalid};

/// Why a block does not extend its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInvalid {
    HeightDiscontinuity,
    DifficultyMismatch,
    PreviousHashMismatch,
    TransactionOrdering,
    InvalidBlock(BlockInvalid),
    InsufficientBalance,
}

impl LinkInvalid {
    pub fn code(&self) -> u16 {
        match self {
            LinkInvalid::HeightDiscontinuity => 1,
            LinkInvalid::DifficultyMismatch => 2,
            LinkInvalid::PreviousHashMismatch => 3,
            LinkInvalid::TransactionOrdering => 4,
            LinkInvalid::InvalidBlock(_) => 5,
            LinkInvalid::InsufficientBalance => 6,
        }
    }
}

impl fmt::Display for LinkInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkInvalid::InvalidBlock(inner) => write!(f, "{}.{}", self.code(), inner),
            _ => write!(f, "{}", self.code()),
        }
    }
}

impl std::error::Error for LinkInvalid {}

/// Two-block chain validation of `block` on top of `prev`.
///
/// `balance_of` answers sender balances as of `prev`: the live cache when
/// `prev` is the canonical tip, a cold replay otherwise.
pub fn is_part_of_chain_valid(
    prev: &Block,
    block: &Block,
    balance_of: impl Fn(&Address) -> BigInt,
    consensus: &ConsensusConfig,
    now_ms: u64,
) -> Result<(), LinkInvalid> {
    if block.height != prev.height + 1 {
        return Err(LinkInvalid::HeightDiscontinuity);
    }
    if block.difficulty != get_block_difficulty(prev, block.timestamp, consensus) {
        return Err(LinkInvalid::DifficultyMismatch);
    }
    if block.previous_hash != prev.hash {
        return Err(LinkInvalid::PreviousHashMismatch);
    }
    if !timestamps_follow(prev, block) {
        return Err(LinkInvalid::TransactionOrdering);
    }

    block
        .is_valid(consensus, now_ms)
        .map_err(LinkInvalid::InvalidBlock)?;

    for (sender, spend) in spends_by_sender(block, consensus.precision) {
        if balance_of(&sender) < spend {
            return Err(LinkInvalid::InsufficientBalance);
        }
    }
    Ok(())
}

/// Every timestamped transaction in `block` must be at or after every one in
/// `prev`, and the two windows must not collapse onto the same instant.
fn timestamps_follow(prev: &Block, block: &Block) -> bool {
    let (Some((prev_min, prev_max)), Some((min, max))) = (timestamp_range(prev), timestamp_range(block)) else {
        return true;
    };
    min >= prev_max && max > prev_min
}

fn timestamp_range(block: &Block) -> Option<(u64, u64)> {
    block
        .transactions
        .iter()
        .filter_map(|tx| tx.timestamp)
        .fold(None, |range, ts| match range {
            None => Some((ts, ts)),
            Some((lo, hi)) => Some((lo.min(ts), hi.max(ts))),
        })
}

/// Total debited per sender across the block's non-coinbase transactions.
pub fn spends_by_sender(block: &Block, precision: usize) -> HashMap<Address, BigInt> {
    let mut spends: HashMap<Address, BigInt> = HashMap::new();
    for tx in block.transactions.iter().skip(1) {
        if let Some(sender) = tx.sender() {
            *spends.entry(sender).or_default() += tx.spend(precision);
        }
    }
    spends
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::crypto::KeyPair;
    use crate::miner::{mine_block, PauseToken};
    use crate::transaction::{Transaction, TxInvalid};

    fn mine(block: Block, consensus: &ConsensusConfig) -> Block {
        mine_block(block, consensus, 8, &PauseToken::new()).unwrap().unwrap()
    }

    fn child(prev: &Block, consensus: &ConsensusConfig, transactions: Vec<Transaction>) -> Block {
        let timestamp = prev.timestamp + consensus.target_block_time_ms;
        let difficulty = get_block_difficulty(prev, timestamp, consensus);
        Block::new(prev.hash, prev.height + 1, timestamp, difficulty, transactions)
    }

    fn coinbase(consensus: &ConsensusConfig, fees: &str) -> Transaction {
        let amount = consensus.reward() + codec::parse_amount(fees, consensus.precision).unwrap();
        Transaction::coinbase(vec![4u8; 20], codec::canonicalize(&amount, consensus.precision))
    }

    #[test]
    fn test_valid_link() {
        let consensus = ConsensusConfig::testing();
        let genesis = Block::genesis(&consensus).unwrap();
        let block = mine(child(&genesis, &consensus, vec![coinbase(&consensus, "0")]), &consensus);
        assert_eq!(
            is_part_of_chain_valid(&genesis, &block, |_| BigInt::default(), &consensus, block.timestamp),
            Ok(())
        );
    }

    #[test]
    fn test_header_link_codes() {
        let consensus = ConsensusConfig::testing();
        let genesis = Block::genesis(&consensus).unwrap();
        let now = genesis.timestamp + consensus.target_block_time_ms;
        let zero = |_: &Address| BigInt::default();

        let mut block = child(&genesis, &consensus, vec![coinbase(&consensus, "0")]);
        block.height = 2;
        assert_eq!(
            is_part_of_chain_valid(&genesis, &block, zero, &consensus, now),
            Err(LinkInvalid::HeightDiscontinuity)
        );

        let mut block = child(&genesis, &consensus, vec![coinbase(&consensus, "0")]);
        block.difficulty += consensus.quantum();
        assert_eq!(
            is_part_of_chain_valid(&genesis, &block, zero, &consensus, now),
            Err(LinkInvalid::DifficultyMismatch)
        );

        let mut block = child(&genesis, &consensus, vec![coinbase(&consensus, "0")]);
        block.previous_hash = [5u8; 32];
        assert_eq!(
            is_part_of_chain_valid(&genesis, &block, zero, &consensus, now),
            Err(LinkInvalid::PreviousHashMismatch)
        );

        // Unmined: the stored hash does not match the recomputed one.
        let block = child(&genesis, &consensus, vec![coinbase(&consensus, "0")]);
        let err = is_part_of_chain_valid(&genesis, &block, zero, &consensus, now).unwrap_err();
        assert_eq!(err, LinkInvalid::InvalidBlock(BlockInvalid::HashMismatch));
        assert_eq!(err.to_string(), "5.4");
    }

    #[test]
    fn test_transaction_timestamp_window() {
        let consensus = ConsensusConfig::testing();
        let genesis = Block::genesis(&consensus).unwrap();
        let keypair = KeyPair::generate();
        let at = |ts: u64| Transaction::new_transfer(keypair.address(), [2u8; 20], "1", "0", ts);

        let mut prev = child(&genesis, &consensus, vec![coinbase(&consensus, "0"), at(100), at(200)]);
        prev.hash = [6u8; 32];
        let now = prev.timestamp + consensus.target_block_time_ms;
        let zero = |_: &Address| BigInt::default();

        let earlier = child(&prev, &consensus, vec![coinbase(&consensus, "0"), at(150)]);
        assert_eq!(
            is_part_of_chain_valid(&prev, &earlier, zero, &consensus, now),
            Err(LinkInvalid::TransactionOrdering)
        );

        // Passes the window, then fails later on the unmined hash.
        let later = child(&prev, &consensus, vec![coinbase(&consensus, "0"), at(200), at(300)]);
        assert!(matches!(
            is_part_of_chain_valid(&prev, &later, zero, &consensus, now),
            Err(LinkInvalid::InvalidBlock(_))
        ));

        let mut flat = child(&genesis, &consensus, vec![coinbase(&consensus, "0"), at(100)]);
        flat.hash = [7u8; 32];
        let same = child(&flat, &consensus, vec![coinbase(&consensus, "0"), at(100)]);
        assert_eq!(
            is_part_of_chain_valid(&flat, &same, zero, &consensus, now),
            Err(LinkInvalid::TransactionOrdering)
        );
    }

    #[test]
    fn test_sender_balance_covers_all_spends() {
        let consensus = ConsensusConfig::testing();
        let genesis = Block::genesis(&consensus).unwrap();
        let keypair = KeyPair::generate();
        let ts = genesis.timestamp + 1;

        let mut first = Transaction::new_transfer(keypair.address(), [2u8; 20], "1", "0.5", ts);
        first.sign(&keypair);
        let mut second = Transaction::new_transfer(keypair.address(), [3u8; 20], "2", "0.5", ts + 1);
        second.sign(&keypair);

        let block = mine(
            child(&genesis, &consensus, vec![coinbase(&consensus, "1"), first, second]),
            &consensus,
        );
        let now = block.timestamp;
        let sender = keypair.address();
        let balance = |enough: i64| {
            move |address: &Address| {
                if *address == sender {
                    BigInt::from(enough)
                } else {
                    BigInt::default()
                }
            }
        };

        assert_eq!(
            is_part_of_chain_valid(&genesis, &block, balance(399_999_999), &consensus, now),
            Err(LinkInvalid::InsufficientBalance)
        );
        assert_eq!(is_part_of_chain_valid(&genesis, &block, balance(400_000_000), &consensus, now), Ok(()));

        let mut forged = block.clone();
        forged.transactions[1].amount = Some("9".to_string());
        let forged = mine(forged, &consensus);
        assert_eq!(
            is_part_of_chain_valid(&genesis, &forged, balance(i64::MAX), &consensus, now),
            Err(LinkInvalid::InvalidBlock(BlockInvalid::Transaction(TxInvalid::SignatureVerification)))
        );
    }
}

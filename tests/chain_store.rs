use cairnchain::blockchain::{get_block_difficulty, AddBlockError, Block, Chain};
use cairnchain::codec;
use cairnchain::config::ConsensusConfig;
use cairnchain::crypto::KeyPair;
use cairnchain::miner::{mine_block, PauseToken};
use cairnchain::persistence::{BlockStore, Database};
use cairnchain::transaction::Transaction;
use num_bigint::BigInt;
use tempfile::tempdir;

const SLOW: u64 = 60_000;
const FAST: u64 = 1_000;

fn now(consensus: &ConsensusConfig) -> u64 {
    consensus.genesis_timestamp + 86_400_000
}

fn child(parent: &Block, gap: u64, reward_to: [u8; 20], txs: Vec<Transaction>, consensus: &ConsensusConfig) -> Block {
    let timestamp = parent.timestamp + gap;
    let difficulty = get_block_difficulty(parent, timestamp, consensus);
    let fees: BigInt = txs.iter().map(|tx| tx.fee_value(consensus.precision)).sum();
    let coinbase = Transaction::coinbase(
        reward_to.to_vec(),
        codec::canonicalize(&(consensus.reward() + fees), consensus.precision),
    );
    let mut transactions = vec![coinbase];
    transactions.extend(txs);
    let template = Block::new(parent.hash, parent.height + 1, timestamp, difficulty, transactions);
    mine_block(template, consensus, 8, &PauseToken::new()).unwrap().unwrap()
}

fn open(path: &str, consensus: &ConsensusConfig) -> Chain {
    Chain::new(consensus.clone(), Box::new(Database::open(path).unwrap())).unwrap()
}

#[test]
fn test_reorg_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.db");
    let path = path.to_str().unwrap();
    let consensus = ConsensusConfig::testing();
    let alice = KeyPair::generate();
    let miner_a = [0xAA; 20];
    let miner_b = [0xBB; 20];

    let (fork_tip, spend_hash) = {
        let mut chain = open(path, &consensus);
        let genesis = chain.genesis().clone();

        // Shared prefix funds Alice.
        let funding = child(&genesis, SLOW, alice.address(), vec![], &consensus);
        chain.add_block(funding.clone(), now(&consensus)).unwrap();

        // Branch A: two slow blocks, one carrying Alice's spend.
        let mut spend = Transaction::new_transfer(alice.address(), [0xCC; 20], "10", "0.5", funding.timestamp + 1);
        spend.sign(&alice);
        let a2 = child(&funding, SLOW, miner_a, vec![spend.clone()], &consensus);
        let a3 = child(&a2, SLOW, miner_a, vec![], &consensus);
        chain.add_block(a2, now(&consensus)).unwrap();
        chain.add_block(a3.clone(), now(&consensus)).unwrap();
        assert_eq!(chain.tip(), a3.hash);
        assert_eq!(chain.balance(&[0xCC; 20]), codec::parse_amount("10", consensus.precision).unwrap());

        // Branch B: three fast blocks raise the difficulty, so more work.
        let b2 = child(&funding, FAST, miner_b, vec![], &consensus);
        let b3 = child(&b2, FAST, miner_b, vec![], &consensus);
        let b4 = child(&b3, FAST, miner_b, vec![], &consensus);
        for block in [b2, b3, b4.clone()] {
            chain.add_block(block, now(&consensus)).unwrap();
        }
        assert_eq!(chain.tip(), b4.hash);
        assert_eq!(chain.height(), 4);
        // The spend only lived on the abandoned branch.
        assert_eq!(chain.balance(&[0xCC; 20]), BigInt::default());
        assert_eq!(chain.balances(), &chain.replay_balances(&chain.tip(), None).unwrap());
        (b4.hash, spend.hash())
    };

    let chain = open(path, &consensus);
    assert_eq!(chain.tip(), fork_tip);
    assert_eq!(chain.height(), 4);
    assert_eq!(chain.balance(&alice.address()), consensus.reward());
    assert_eq!(chain.balance(&[0xCC; 20]), BigInt::default());
    assert!(!chain.is_pending(&spend_hash));
    assert_eq!(chain.blocks_from(1, 10).unwrap().len(), 4);
}

#[test]
fn test_unknown_parent_and_store_contents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.db");
    let path = path.to_str().unwrap();
    let consensus = ConsensusConfig::testing();
    let mut chain = open(path, &consensus);
    let genesis = chain.genesis().clone();

    let first = child(&genesis, SLOW, [1; 20], vec![], &consensus);
    let second = child(&first, SLOW, [1; 20], vec![], &consensus);
    assert_eq!(chain.add_block(second.clone(), now(&consensus)), Err(AddBlockError::UnknownParent));
    assert_eq!(AddBlockError::UnknownParent.to_string(), "10");

    chain.add_block(first.clone(), now(&consensus)).unwrap();
    chain.add_block(second.clone(), now(&consensus)).unwrap();
    assert_eq!(chain.add_block(second.clone(), now(&consensus)), Err(AddBlockError::AlreadyKnown));

    let store = Database::open(path).unwrap();
    let stored: Vec<_> = store.blocks().unwrap().into_iter().map(|b| b.hash).collect();
    assert_eq!(stored, vec![first.hash, second.hash]);
    assert_eq!(store.get_block(&second.hash).unwrap(), Some(second));
}

#[test]
fn test_side_branch_spends_are_checked_against_their_own_ancestry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.db");
    let consensus = ConsensusConfig::testing();
    let mut chain = open(path.to_str().unwrap(), &consensus);
    let genesis = chain.genesis().clone();
    let alice = KeyPair::generate();
    let spend = |amount: &str, ts: u64| {
        let mut tx = Transaction::new_transfer(alice.address(), [0xCC; 20], amount, "0.5", ts);
        tx.sign(&alice);
        tx
    };

    let funding = child(&genesis, SLOW, alice.address(), vec![], &consensus);
    chain.add_block(funding.clone(), now(&consensus)).unwrap();

    // Canonical branch: Alice spends 40.5 of her 50.
    let a2 = child(&funding, SLOW, [0xAA; 20], vec![spend("40", funding.timestamp + 1)], &consensus);
    let a3 = child(&a2, SLOW, [0xAA; 20], vec![], &consensus);
    chain.add_block(a2, now(&consensus)).unwrap();
    chain.add_block(a3.clone(), now(&consensus)).unwrap();
    assert_eq!(chain.balance(&alice.address()), codec::parse_amount("9.5", consensus.precision).unwrap());

    // 45.5 only fits the side branch's view of Alice, where the 40 never happened.
    let b2 = child(&funding, SLOW, [0xBB; 20], vec![spend("45", funding.timestamp + 2)], &consensus);
    chain.add_block(b2.clone(), now(&consensus)).unwrap();
    assert_eq!(chain.tip(), a3.hash);
    assert!(chain.get_block(&b2.hash).unwrap().is_some());

    // 5.5 fits the canonical 9.5 but not the 4.5 left on the side branch.
    let b3 = child(&b2, SLOW, [0xBB; 20], vec![spend("5", b2.timestamp + 1)], &consensus);
    let err = chain.add_block(b3.clone(), now(&consensus)).unwrap_err();
    assert_eq!(err.to_string(), "3.6");
    assert!(!chain.contains(&b3.hash));
    assert_eq!(chain.tip(), a3.hash);
}

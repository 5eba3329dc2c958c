//! Verification dispatcher
//!
//! Stateless checks (structure, signatures, proof-of-work) are farmed out to
//! a pool of OS threads. Each worker owns a `crossbeam-channel` inbox and
//! answers every job with a validity code on the shared verdict channel.
//! The owner of the [`Dispatcher`] (the node coordinator) applies verified
//! items to the chain, so chain mutation stays on one task.

use crate::blockchain::{Block, Sha256Hash};
use crate::codec::{MinifiedBlock, MinifiedTransaction};
use crate::config::{ConsensusConfig, DispatcherConfig};
use crate::error::{ChainError, Result};
use crate::transaction::Transaction;
use crossbeam_channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Code returned for a job that could not be decoded at all.
pub const MALFORMED_JOB: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Block,
    Transaction,
}

/// Wire shape of a validation job.
#[derive(Debug, Serialize, Deserialize)]
pub struct Job {
    pub kind: JobKind,
    pub payload: serde_json::Value,
}

/// What a caller waiting on a submission finally learns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    /// A stateless check failed; carries the validity code.
    Invalid(String),
    /// The chain refused the verified item; carries the admission code.
    Rejected(String),
}

/// `(worker id, validity code)` sent back by a worker.
pub type Verdict = (usize, String);

/// Run one serialized job. `"0"` means valid.
pub fn verify(job: &str, consensus: &ConsensusConfig, now_ms: u64) -> String {
    let Ok(job) = serde_json::from_str::<Job>(job) else {
        return MALFORMED_JOB.to_string();
    };
    match job.kind {
        JobKind::Block => serde_json::from_value::<MinifiedBlock>(job.payload)
            .map_err(ChainError::from)
            .and_then(Block::try_from)
            .map_or_else(|_| MALFORMED_JOB.to_string(), |b| b.validity_code(consensus, now_ms)),
        JobKind::Transaction => serde_json::from_value::<MinifiedTransaction>(job.payload)
            .map_err(ChainError::from)
            .and_then(Transaction::try_from)
            .map_or_else(|_| MALFORMED_JOB.to_string(), |t| t.validity_code(consensus, now_ms).to_string()),
    }
}

/// An item handed to a worker, returned to the owner with its verdict.
#[derive(Debug, Clone)]
pub enum Item {
    Block(Block),
    Transaction(Transaction),
}

impl Item {
    pub fn hash(&self) -> Sha256Hash {
        match self {
            Item::Block(b) => b.hash,
            Item::Transaction(t) => t.hash(),
        }
    }

    fn to_job(&self) -> Result<String> {
        let job = match self {
            Item::Block(b) => Job {
                kind: JobKind::Block,
                payload: serde_json::to_value(b.minify())?,
            },
            Item::Transaction(t) => Job {
                kind: JobKind::Transaction,
                payload: serde_json::to_value(t.minify())?,
            },
        };
        Ok(serde_json::to_string(&job)?)
    }
}

/// A verified item together with its validity code.
#[derive(Debug)]
pub struct Completed {
    pub item: Item,
    pub code: String,
}

impl Completed {
    pub fn is_valid(&self) -> bool {
        self.code == "0"
    }
}

/// Admission queue ordered by rank (height or timestamp), then hash.
#[derive(Debug)]
struct Queue<T> {
    order: BTreeMap<(u64, Sha256Hash), T>,
    ranks: HashMap<Sha256Hash, u64>,
}

impl<T> Queue<T> {
    fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            ranks: HashMap::new(),
        }
    }

    fn contains(&self, hash: &Sha256Hash) -> bool {
        self.ranks.contains_key(hash)
    }

    fn insert(&mut self, rank: u64, hash: Sha256Hash, item: T) -> bool {
        if self.ranks.contains_key(&hash) {
            return false;
        }
        self.ranks.insert(hash, rank);
        self.order.insert((rank, hash), item);
        true
    }

    fn pop_first(&mut self) -> Option<T> {
        let ((_, hash), item) = self.order.pop_first()?;
        self.ranks.remove(&hash);
        Some(item)
    }

    fn len(&self) -> usize {
        self.ranks.len()
    }

    fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

pub struct Dispatcher {
    inboxes: Vec<Sender<String>>,
    threads: Vec<JoinHandle<()>>,
    idle: BTreeSet<usize>,
    busy: HashMap<usize, Item>,
    blocks: Queue<Block>,
    transactions: Queue<Transaction>,
    waiters: HashMap<Sha256Hash, Vec<oneshot::Sender<Outcome>>>,
    tx_capacity: usize,
    prefer_blocks: bool,
}

impl Dispatcher {
    /// Start `config.workers` verifier threads. Verdicts arrive on the
    /// returned receiver and must be handed back through [`Dispatcher::on_verdict`].
    pub fn spawn(
        config: &DispatcherConfig,
        consensus: &ConsensusConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Verdict>)> {
        if config.workers == 0 {
            return Err(ChainError::DispatcherError("at least one worker is required".to_string()));
        }
        let (verdict_tx, verdict_rx) = mpsc::unbounded_channel();
        let mut inboxes = Vec::with_capacity(config.workers);
        let mut threads = Vec::with_capacity(config.workers);

        for id in 0..config.workers {
            let (job_tx, job_rx) = unbounded::<String>();
            let verdicts = verdict_tx.clone();
            let consensus = consensus.clone();
            let handle = std::thread::Builder::new()
                .name(format!("verifier-{}", id))
                .spawn(move || {
                    for job in job_rx.iter() {
                        let code = verify(&job, &consensus, crate::now_ms());
                        if verdicts.send((id, code)).is_err() {
                            break;
                        }
                    }
                })?;
            inboxes.push(job_tx);
            threads.push(handle);
        }

        let dispatcher = Dispatcher {
            inboxes,
            threads,
            idle: (0..config.workers).collect(),
            busy: HashMap::new(),
            blocks: Queue::new(),
            transactions: Queue::new(),
            waiters: HashMap::new(),
            tx_capacity: config.tx_queue_capacity,
            prefer_blocks: true,
        };
        Ok((dispatcher, verdict_rx))
    }

    pub fn idle_workers(&self) -> usize {
        self.idle.len()
    }

    pub fn busy_workers(&self) -> usize {
        self.busy.len()
    }

    pub fn queued_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn queued_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Queued or being verified.
    pub fn is_pending(&self, hash: &Sha256Hash) -> bool {
        self.blocks.contains(hash)
            || self.transactions.contains(hash)
            || self.busy.values().any(|item| item.hash() == *hash)
    }

    fn wait_on(&mut self, hash: Sha256Hash, waiter: Option<oneshot::Sender<Outcome>>) {
        if let Some(waiter) = waiter {
            self.waiters.entry(hash).or_default().push(waiter);
        }
    }

    /// Queue a block for verification. A block already queued or in flight
    /// only gains another waiter. Returns whether it was newly queued.
    pub fn submit_block(&mut self, block: Block, waiter: Option<oneshot::Sender<Outcome>>) -> Result<bool> {
        let hash = block.hash;
        let pending = self.is_pending(&hash);
        self.wait_on(hash, waiter);
        if pending {
            return Ok(false);
        }
        self.blocks.insert(block.height, hash, block);
        self.schedule()?;
        Ok(true)
    }

    /// Queue a transaction for verification. When the queue is full the
    /// submission is dropped and its waiter with it.
    pub fn submit_transaction(&mut self, tx: Transaction, waiter: Option<oneshot::Sender<Outcome>>) -> Result<bool> {
        let hash = tx.hash();
        if self.is_pending(&hash) {
            self.wait_on(hash, waiter);
            return Ok(false);
        }
        if self.transactions.len() >= self.tx_capacity {
            debug!(tx = %hex::encode(hash), "Transaction queue full, dropping");
            return Ok(false);
        }
        self.wait_on(hash, waiter);
        self.transactions.insert(tx.timestamp.unwrap_or_default(), hash, tx);
        self.schedule()?;
        Ok(true)
    }

    /// Take the next item, alternating between the two queues while both
    /// have work.
    fn next_item(&mut self) -> Option<Item> {
        let take_block = if self.blocks.is_empty() {
            false
        } else {
            self.prefer_blocks || self.transactions.is_empty()
        };
        if take_block {
            self.prefer_blocks = false;
            self.blocks.pop_first().map(Item::Block)
        } else {
            self.prefer_blocks = true;
            self.transactions.pop_first().map(Item::Transaction)
        }
    }

    /// Hand queued work to idle workers.
    pub fn schedule(&mut self) -> Result<()> {
        while let Some(&worker) = self.idle.iter().next() {
            let Some(item) = self.next_item() else { break };
            let job = item.to_job()?;
            self.idle.remove(&worker);
            if self.inboxes[worker].send(job).is_err() {
                return Err(ChainError::DispatcherError(format!("worker {} has stopped", worker)));
            }
            self.busy.insert(worker, item);
        }
        Ok(())
    }

    /// Return the worker to the idle set and hand back what it verified.
    /// The caller applies the item and then calls [`Dispatcher::resolve`].
    pub fn on_verdict(&mut self, verdict: Verdict) -> Option<Completed> {
        let (worker, code) = verdict;
        let Some(item) = self.busy.remove(&worker) else {
            warn!(worker, "Verdict from a worker that was not busy");
            return None;
        };
        self.idle.insert(worker);
        Some(Completed { item, code })
    }

    /// Tell every waiter on `hash` the outcome, then schedule more work.
    pub fn resolve(&mut self, hash: &Sha256Hash, outcome: Outcome) -> Result<()> {
        if let Some(waiters) = self.waiters.remove(hash) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
        self.schedule()
    }

    /// Close the worker inboxes and wait for the threads to exit.
    pub fn shutdown(mut self) {
        self.inboxes.clear();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::crypto::KeyPair;
    use crate::miner::{mine_block, PauseToken};
    use std::time::Duration;

    fn now(consensus: &ConsensusConfig) -> u64 {
        consensus.genesis_timestamp + 86_400_000
    }

    fn mined_child(parent: &Block, consensus: &ConsensusConfig) -> Block {
        let timestamp = parent.timestamp + 60_000;
        let difficulty = crate::blockchain::get_block_difficulty(parent, timestamp, consensus);
        let coinbase = Transaction::coinbase(
            vec![3u8; 20],
            codec::canonicalize(&consensus.reward(), consensus.precision),
        );
        let block = Block::new(parent.hash, parent.height + 1, timestamp, difficulty, vec![coinbase]);
        mine_block(block, consensus, 8, &PauseToken::new()).unwrap().unwrap()
    }

    fn signed(keypair: &KeyPair, ts: u64) -> Transaction {
        let mut tx = Transaction::new_transfer(keypair.address(), [2u8; 20], "1", "0.01", ts);
        tx.sign(keypair);
        tx
    }

    #[test]
    fn test_verify_codes() {
        let consensus = ConsensusConfig::testing();
        let genesis = Block::genesis(&consensus).unwrap();
        let block = mined_child(&genesis, &consensus);
        let now = now(&consensus);

        let job = Item::Block(block.clone()).to_job().unwrap();
        assert_eq!(verify(&job, &consensus, now), "0");

        let mut tampered = block;
        tampered.nonce += 1;
        let job = Item::Block(tampered).to_job().unwrap();
        assert_eq!(verify(&job, &consensus, now), "4");

        let keypair = KeyPair::generate();
        let mut tx = signed(&keypair, now - 1);
        let job = Item::Transaction(tx.clone()).to_job().unwrap();
        assert_eq!(verify(&job, &consensus, now), "0");
        if let Some(sig) = tx.signature.as_mut() {
            sig[5] ^= 0x01;
        }
        let job = Item::Transaction(tx).to_job().unwrap();
        assert_eq!(verify(&job, &consensus, now), "17");

        assert_eq!(verify("not json", &consensus, now), MALFORMED_JOB);
        assert_eq!(verify(r#"{"kind":"block","payload":{"p":"zz"}}"#, &consensus, now), MALFORMED_JOB);
    }

    #[test]
    fn test_queue_orders_by_rank() {
        let mut queue = Queue::new();
        assert!(queue.insert(5, [5u8; 32], "five"));
        assert!(queue.insert(2, [2u8; 32], "two"));
        assert!(queue.insert(9, [1u8; 32], "nine"));
        assert!(!queue.insert(1, [2u8; 32], "dup"));
        assert_eq!(queue.pop_first(), Some("two"));
        assert_eq!(queue.pop_first(), Some("five"));
        assert_eq!(queue.pop_first(), Some("nine"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_submissions_share_one_verdict() {
        tokio::time::timeout(Duration::from_secs(30), async {
            let consensus = ConsensusConfig::testing();
            let genesis = Block::genesis(&consensus).unwrap();
            let block = mined_child(&genesis, &consensus);
            let config = DispatcherConfig { workers: 2, tx_queue_capacity: 10 };
            let (mut dispatcher, mut verdicts) = Dispatcher::spawn(&config, &consensus).unwrap();

            let (first_tx, first_rx) = oneshot::channel();
            let (second_tx, second_rx) = oneshot::channel();
            assert!(dispatcher.submit_block(block.clone(), Some(first_tx)).unwrap());
            assert!(!dispatcher.submit_block(block.clone(), Some(second_tx)).unwrap());
            assert_eq!(dispatcher.busy_workers(), 1);
            assert!(dispatcher.is_pending(&block.hash));

            let verdict = verdicts.recv().await.unwrap();
            let completed = dispatcher.on_verdict(verdict).unwrap();
            assert!(completed.is_valid());
            assert_eq!(completed.item.hash(), block.hash);
            dispatcher.resolve(&block.hash, Outcome::Accepted).unwrap();

            assert_eq!(first_rx.await.unwrap(), Outcome::Accepted);
            assert_eq!(second_rx.await.unwrap(), Outcome::Accepted);
            assert_eq!(dispatcher.idle_workers(), 2);
            assert!(!dispatcher.is_pending(&block.hash));
            dispatcher.shutdown();
        })
        .await
        .expect("test_duplicate_submissions_share_one_verdict timed out");
    }

    #[tokio::test]
    async fn test_full_transaction_queue_drops_submission() {
        tokio::time::timeout(Duration::from_secs(30), async {
            let consensus = ConsensusConfig::testing();
            let keypair = KeyPair::generate();
            let ts = now(&consensus);
            let config = DispatcherConfig { workers: 1, tx_queue_capacity: 1 };
            let (mut dispatcher, mut verdicts) = Dispatcher::spawn(&config, &consensus).unwrap();

            let (a_tx, a_rx) = oneshot::channel();
            let (b_tx, b_rx) = oneshot::channel();
            let (c_tx, c_rx) = oneshot::channel();
            // First goes straight to the only worker, second waits in the
            // queue, third finds the queue full.
            assert!(dispatcher.submit_transaction(signed(&keypair, ts), Some(a_tx)).unwrap());
            assert!(dispatcher.submit_transaction(signed(&keypair, ts + 1), Some(b_tx)).unwrap());
            assert!(!dispatcher.submit_transaction(signed(&keypair, ts + 2), Some(c_tx)).unwrap());
            assert_eq!(dispatcher.queued_transactions(), 1);
            assert!(c_rx.await.is_err());

            for _ in 0..2 {
                let verdict = verdicts.recv().await.unwrap();
                let completed = dispatcher.on_verdict(verdict).unwrap();
                let outcome = if completed.is_valid() {
                    Outcome::Accepted
                } else {
                    Outcome::Invalid(completed.code.clone())
                };
                dispatcher.resolve(&completed.item.hash(), outcome).unwrap();
            }
            assert_eq!(a_rx.await.unwrap(), Outcome::Accepted);
            assert_eq!(b_rx.await.unwrap(), Outcome::Accepted);
            dispatcher.shutdown();
        })
        .await
        .expect("test_full_transaction_queue_drops_submission timed out");
    }

    #[tokio::test]
    async fn test_lowest_height_dispatched_first() {
        tokio::time::timeout(Duration::from_secs(30), async {
            let consensus = ConsensusConfig::testing();
            let genesis = Block::genesis(&consensus).unwrap();
            let first = mined_child(&genesis, &consensus);
            let second = mined_child(&first, &consensus);
            let third = mined_child(&second, &consensus);
            let config = DispatcherConfig { workers: 1, tx_queue_capacity: 10 };
            let (mut dispatcher, mut verdicts) = Dispatcher::spawn(&config, &consensus).unwrap();

            dispatcher.submit_block(third.clone(), None).unwrap();
            dispatcher.submit_block(second.clone(), None).unwrap();
            dispatcher.submit_block(first.clone(), None).unwrap();

            let mut order = Vec::new();
            for _ in 0..3 {
                let verdict = verdicts.recv().await.unwrap();
                let completed = dispatcher.on_verdict(verdict).unwrap();
                order.push(completed.item.hash());
                dispatcher.resolve(&completed.item.hash(), Outcome::Accepted).unwrap();
            }
            // `third` was already in flight; the queue then yields by height.
            assert_eq!(order, vec![third.hash, first.hash, second.hash]);
            dispatcher.shutdown();
        })
        .await
        .expect("test_lowest_height_dispatched_first timed out");
    }
}

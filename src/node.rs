//! Node coordinator
//!
//! One task owns every piece of consensus-critical state: the chain, the
//! pending pool, the peer set and the ban registry. Peers, verifier threads,
//! the miner and API callers all talk to it through channels, so `add_block`
//! and `add_transaction` never run concurrently.

use crate::blockchain::{AddBlockError, Block, Chain, Sha256Hash};
use crate::codec;
use crate::config::Config;
use crate::crypto::{self, Address};
use crate::dispatcher::{Completed, Dispatcher, Item, Outcome, Verdict};
use crate::error::{ChainError, Result};
use crate::miner::{mine_block, PauseToken};
use crate::network::{self, discovery, Message, NetworkEvent, NodeAddress, PeerId, PeerSet};
use crate::now_ms;
use crate::persistence::{BlockStore, Database, PeerRegistry};
use crate::sync::{NodeSynchronizer, SyncState};
use crate::transaction::Transaction;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Syncing,
    Ready,
}

/// Snapshot returned by [`NodeHandle::status`].
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: NodeState,
    pub height: u64,
    pub tip: String,
    pub peers: usize,
    pub outbound: usize,
    pub pending: usize,
    pub queued_blocks: usize,
    pub queued_transactions: usize,
    pub mining: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum BlockQuery {
    Hash(Sha256Hash),
    Height(u64),
}

#[derive(Debug)]
enum Command {
    SubmitBlock(Block, oneshot::Sender<Outcome>),
    SubmitTransaction(Transaction, oneshot::Sender<Outcome>),
    Status(oneshot::Sender<NodeStatus>),
    Balance(Address, oneshot::Sender<String>),
    Block(BlockQuery, oneshot::Sender<Option<Block>>),
    Pending(oneshot::Sender<Vec<Transaction>>),
    Shutdown,
}

/// Cloneable client of a running [`Node`].
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
}

impl NodeHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<oneshot::Receiver<T>> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| ChainError::Shutdown)?;
        Ok(rx)
    }

    /// `None` when the submission was dropped without a verdict.
    pub async fn submit_block(&self, block: Block) -> Result<Option<Outcome>> {
        let rx = self.request(|tx| Command::SubmitBlock(block, tx)).await?;
        Ok(rx.await.ok())
    }

    /// `None` when the transaction queue was full.
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<Option<Outcome>> {
        let rx = self.request(|reply| Command::SubmitTransaction(tx, reply)).await?;
        Ok(rx.await.ok())
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let rx = self.request(Command::Status).await?;
        rx.await.map_err(|_| ChainError::Shutdown)
    }

    /// Canonical amount string.
    pub async fn balance(&self, address: Address) -> Result<String> {
        let rx = self.request(|tx| Command::Balance(address, tx)).await?;
        rx.await.map_err(|_| ChainError::Shutdown)
    }

    pub async fn block(&self, query: BlockQuery) -> Result<Option<Block>> {
        let rx = self.request(|tx| Command::Block(query, tx)).await?;
        rx.await.map_err(|_| ChainError::Shutdown)
    }

    pub async fn pending(&self) -> Result<Vec<Transaction>> {
        let rx = self.request(Command::Pending).await?;
        rx.await.map_err(|_| ChainError::Shutdown)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.commands.send(Command::Shutdown).await.map_err(|_| ChainError::Shutdown)
    }
}

/// In-flight proof-of-work search.
struct MinerJob {
    token: PauseToken,
    parent: Sha256Hash,
}

pub struct Node {
    config: Config,
    chain: Chain,
    registry: Box<dyn PeerRegistry>,
    dispatcher: Dispatcher,
    verdicts: mpsc::UnboundedReceiver<Verdict>,
    peers: PeerSet,
    dialing: HashSet<String>,
    sync: NodeSynchronizer,
    events_tx: mpsc::Sender<NetworkEvent>,
    events_rx: mpsc::Receiver<NetworkEvent>,
    commands: mpsc::Receiver<Command>,
    mined_tx: mpsc::Sender<Block>,
    mined_rx: mpsc::Receiver<Block>,
    reward_address: Option<Address>,
    miner: Option<MinerJob>,
    self_addr: String,
}

impl Node {
    /// Open the SQLite block store and peer registry at `config.database.path`.
    pub fn open(config: Config) -> Result<(Self, NodeHandle)> {
        let db_path = Path::new(&config.database.path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ChainError::DatabaseError(format!("Failed to create data dir {:?}: {}", parent, e))
                })?;
            }
        }
        let store = Database::open(&config.database.path)?;
        let registry = Database::open(&config.database.path)?;
        Self::new(config, Box::new(store), Box::new(registry))
    }

    pub fn new(
        config: Config,
        store: Box<dyn BlockStore>,
        registry: Box<dyn PeerRegistry>,
    ) -> Result<(Self, NodeHandle)> {
        config.validate()?;
        let chain = Chain::new(config.consensus.clone(), store)?;
        let (dispatcher, verdicts) = Dispatcher::spawn(&config.dispatcher, &config.consensus)?;

        for peer in &config.network.bootstrap_peers {
            if discovery::remember(registry.as_ref(), peer)? {
                debug!(peer = %peer, "Seeded bootstrap peer");
            }
        }

        let reward_address = if config.miner.enabled {
            Some(crypto::address_from_hex(&config.miner.reward_address)?)
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (mined_tx, mined_rx) = mpsc::channel(4);
        let sync = NodeSynchronizer::new(
            Duration::from_secs(config.peers.sync_interval_secs),
            config.peers.sync_batch,
        );
        let self_addr = format!("{}:{}", config.network.public_host, config.network.p2p_port);

        let node = Node {
            config,
            chain,
            registry,
            dispatcher,
            verdicts,
            peers: PeerSet::new(),
            dialing: HashSet::new(),
            sync,
            events_tx,
            events_rx,
            commands,
            mined_tx,
            mined_rx,
            reward_address,
            miner: None,
            self_addr,
        };
        Ok((node, NodeHandle { commands: commands_tx }))
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Serve peers on `listener` and coordinate until shutdown.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        let port = listener.local_addr()?.port();
        self.self_addr = format!("{}:{}", self.config.network.public_host, port);
        info!(
            height = self.chain.height(),
            tip = %hex::encode(self.chain.tip()),
            addr = %self.self_addr,
            "Starting CairnChain node"
        );

        let events = self.events_tx.clone();
        let listener_task = tokio::spawn(async move {
            if let Err(e) = network::listen(listener, events).await {
                error!("P2P listener stopped: {}", e);
            }
        });

        let peers_config = self.config.peers.clone();
        let mut reconnect = tokio::time::interval(Duration::from_secs(peers_config.reconnect_interval_secs.max(1)));
        let mut sync_tick = tokio::time::interval(Duration::from_secs(1));
        let mut status = tokio::time::interval(STATUS_INTERVAL);
        self.restart_miner();

        let result = loop {
            let step = tokio::select! {
                Some(command) = self.commands.recv() => match command {
                    Command::Shutdown => break Ok(()),
                    command => self.on_command(command),
                },
                Some(verdict) = self.verdicts.recv() => self.on_verdict(verdict),
                Some(event) = self.events_rx.recv() => self.on_network(event),
                Some(block) = self.mined_rx.recv() => self.on_mined(block),
                _ = reconnect.tick() => self.reconnect(),
                _ = sync_tick.tick() => self.request_sync(),
                _ = status.tick() => {
                    self.log_status();
                    Ok(())
                }
            };
            if let Err(e) = step {
                match e {
                    ChainError::Shutdown => break Ok(()),
                    e => error!("Coordinator step failed: {}", e),
                }
            }
        };

        info!("Shutting down node");
        if let Some(job) = self.miner.take() {
            job.token.pause();
        }
        listener_task.abort();
        self.dispatcher.shutdown();
        result
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            state: if self.sync.state() == SyncState::Syncing {
                NodeState::Syncing
            } else {
                NodeState::Ready
            },
            height: self.chain.height(),
            tip: hex::encode(self.chain.tip()),
            peers: self.peers.len(),
            outbound: self.peers.outbound_count(),
            pending: self.chain.pending_count(),
            queued_blocks: self.dispatcher.queued_blocks(),
            queued_transactions: self.dispatcher.queued_transactions(),
            mining: self.miner.is_some(),
        }
    }

    fn log_status(&self) {
        let status = self.status();
        info!(
            height = status.height,
            tip = %status.tip,
            peers = status.peers,
            pending = status.pending,
            "Node running"
        );
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::SubmitBlock(block, reply) => self.submit_block(block, Some(reply)),
            Command::SubmitTransaction(tx, reply) => self.submit_transaction(tx, Some(reply)),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
                Ok(())
            }
            Command::Balance(address, reply) => {
                let balance = self.chain.balance(&address);
                let _ = reply.send(codec::canonicalize(&balance, self.chain.consensus().precision));
                Ok(())
            }
            Command::Block(query, reply) => {
                let block = match query {
                    BlockQuery::Hash(hash) => self.chain.get_block(&hash)?,
                    BlockQuery::Height(height) => self.chain.get_block_at(height)?,
                };
                let _ = reply.send(block);
                Ok(())
            }
            Command::Pending(reply) => {
                let _ = reply.send(self.chain.pending());
                Ok(())
            }
            Command::Shutdown => Err(ChainError::Shutdown),
        }
    }

    fn submit_block(&mut self, block: Block, waiter: Option<oneshot::Sender<Outcome>>) -> Result<()> {
        if block.hash == self.chain.genesis().hash || self.chain.contains(&block.hash) {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Outcome::Rejected(AddBlockError::AlreadyKnown.to_string()));
            }
            return Ok(());
        }
        self.dispatcher.submit_block(block, waiter)?;
        Ok(())
    }

    fn submit_transaction(&mut self, tx: Transaction, waiter: Option<oneshot::Sender<Outcome>>) -> Result<()> {
        if self.chain.is_pending(&tx.hash()) {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Outcome::Rejected("1".to_string()));
            }
            return Ok(());
        }
        self.dispatcher.submit_transaction(tx, waiter)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Verified items
    // ------------------------------------------------------------------

    fn on_verdict(&mut self, verdict: Verdict) -> Result<()> {
        let Some(completed) = self.dispatcher.on_verdict(verdict) else {
            return self.dispatcher.schedule();
        };
        let hash = completed.item.hash();
        let outcome = self.apply(completed)?;
        self.dispatcher.resolve(&hash, outcome)?;
        self.restart_miner_if_idle();
        Ok(())
    }

    fn apply(&mut self, completed: Completed) -> Result<Outcome> {
        if !completed.is_valid() {
            debug!(item = %hex::encode(completed.item.hash()), code = %completed.code, "Verification failed");
            return Ok(Outcome::Invalid(completed.code));
        }
        match completed.item {
            Item::Block(block) => self.apply_block(block),
            Item::Transaction(tx) => self.apply_transaction(tx),
        }
    }

    fn apply_block(&mut self, block: Block) -> Result<Outcome> {
        let tip_before = self.chain.tip();
        let message = Message::Block(block.minify());
        let height = block.height;

        match self.chain.add_block(block, now_ms()) {
            Ok(()) => {
                self.peers.broadcast(&message, None)?;
                self.sync.reached(self.chain.height());
                if self.chain.tip() != tip_before {
                    self.restart_miner();
                }
                Ok(Outcome::Accepted)
            }
            Err(AddBlockError::UnknownParent) => {
                debug!(height, "Parent unknown, scheduling sync");
                self.sync
                    .on_unknown_parent(height, self.chain.height(), self.chain.consensus().trust_depth);
                Ok(Outcome::Rejected(AddBlockError::UnknownParent.to_string()))
            }
            Err(e) => {
                debug!(height, code = %e, "Block rejected");
                Ok(Outcome::Rejected(e.to_string()))
            }
        }
    }

    fn apply_transaction(&mut self, tx: Transaction) -> Result<Outcome> {
        let message = Message::Transaction(tx.minify());
        match self.chain.add_transaction(tx) {
            Ok(()) => {
                self.peers.broadcast(&message, None)?;
                Ok(Outcome::Accepted)
            }
            Err(e) => Ok(Outcome::Rejected(e.to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Mining
    // ------------------------------------------------------------------

    /// Abandon the current search and start one on the canonical tip.
    fn restart_miner(&mut self) {
        let Some(reward_address) = self.reward_address else { return };
        if let Some(job) = self.miner.take() {
            job.token.pause();
        }

        let template = match self.chain.get_new_block(reward_address, now_ms()) {
            Ok(template) => template,
            Err(e) => {
                error!("Failed to assemble block template: {}", e);
                return;
            }
        };
        let parent = template.previous_hash;
        let token = PauseToken::new();
        let consensus = self.chain.consensus().clone();
        let nonce_batch = self.config.miner.nonce_batch;
        let mined = self.mined_tx.clone();
        let search = token.clone();

        debug!(height = template.height, difficulty = template.difficulty, "Mining");
        tokio::task::spawn_blocking(move || match mine_block(template, &consensus, nonce_batch, &search) {
            Ok(Some(block)) => {
                let _ = mined.blocking_send(block);
            }
            Ok(None) => debug!("Mining interrupted"),
            Err(e) => error!("Mining failed: {}", e),
        });
        self.miner = Some(MinerJob { token, parent });
    }

    fn restart_miner_if_idle(&mut self) {
        if self.miner.is_none() {
            self.restart_miner();
        }
    }

    fn on_mined(&mut self, block: Block) -> Result<()> {
        let current = self.miner.as_ref().map(|job| job.parent);
        if current == Some(block.previous_hash) {
            self.miner = None;
        }
        info!(height = block.height, hash = %block.hash_str(), "Mined block");
        self.submit_block(block, None)
    }

    // ------------------------------------------------------------------
    // Network
    // ------------------------------------------------------------------

    fn ban_timeout_ms(&self) -> u64 {
        self.config.peers.ban_timeout_secs.saturating_mul(1000)
    }

    fn is_banned(&self, addr: &str) -> Result<bool> {
        discovery::is_banned(self.registry.as_ref(), addr, now_ms(), self.ban_timeout_ms())
    }

    fn on_network(&mut self, event: NetworkEvent) -> Result<()> {
        match event {
            NetworkEvent::Incoming(stream, addr) => {
                if self.is_banned(&addr)? {
                    debug!(peer = %addr, "Refusing banned peer");
                    return Ok(());
                }
                let id = self.peers.spawn(stream, addr, false, &self.config.peers, self.events_tx.clone());
                self.greet(id)
            }
            NetworkEvent::Dialed(addr, Ok(stream)) => {
                self.dialing.remove(&addr);
                if self.is_banned(&addr)? {
                    return Ok(());
                }
                info!(peer = %addr, "Connected to peer");
                let advert = advertisement(&addr);
                let id = self.peers.spawn(stream, addr, true, &self.config.peers, self.events_tx.clone());
                self.greet(id)?;
                if let Some(node) = advert {
                    self.peers.broadcast(&Message::Node(node), Some(id))?;
                }
                Ok(())
            }
            NetworkEvent::Dialed(addr, Err(e)) => {
                self.dialing.remove(&addr);
                debug!(peer = %addr, "Dial failed: {}", e);
                Ok(())
            }
            NetworkEvent::Message(id, message) => self.on_message(id, message),
            NetworkEvent::Disconnected(id, ban) => {
                let Some(peer) = self.peers.remove(id) else { return Ok(()) };
                match ban {
                    Some(reason) => {
                        warn!(peer = %peer.addr, code = reason.code(), "Peer banned");
                        discovery::record_ban(self.registry.as_ref(), &peer.addr, now_ms())
                    }
                    None => {
                        debug!(peer = %peer.addr, "Peer disconnected");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Ask a new peer for everything above our tip.
    fn greet(&mut self, id: PeerId) -> Result<()> {
        self.peers.send(id, &Message::Sync(self.chain.height() + 1))?;
        Ok(())
    }

    fn on_message(&mut self, id: PeerId, message: Message) -> Result<()> {
        match message {
            Message::Block(min) => match Block::try_from(min) {
                Ok(block) => self.submit_block(block, None),
                Err(e) => {
                    debug!(peer = id, "Dropping undecodable block: {}", e);
                    Ok(())
                }
            },
            Message::Transaction(min) => match Transaction::try_from(min) {
                Ok(tx) => self.submit_transaction(tx, None),
                Err(e) => {
                    debug!(peer = id, "Dropping undecodable transaction: {}", e);
                    Ok(())
                }
            },
            Message::Node(node) => {
                let addr = node.addr();
                if addr != self.self_addr && discovery::remember(self.registry.as_ref(), &addr)? {
                    debug!(peer = %addr, "Learned peer address");
                }
                Ok(())
            }
            Message::Sync(height) => {
                let blocks = self.sync.serve(&self.chain, height)?;
                if !blocks.is_empty() {
                    self.peers.send(id, &Message::Blocks(blocks))?;
                }
                Ok(())
            }
            Message::Blocks(batch) => {
                let blocks: Vec<Block> = batch.into_iter().filter_map(|b| Block::try_from(b).ok()).collect();
                self.sync.on_batch(&blocks, self.chain.height());
                for block in blocks {
                    self.submit_block(block, None)?;
                }
                Ok(())
            }
            Message::Meta(_) => Ok(()),
        }
    }

    fn reconnect(&mut self) -> Result<()> {
        let busy = self.peers.outbound_count() + self.dialing.len();
        let free = self.config.peers.max_outbound.saturating_sub(busy);
        let mut connected = self.peers.addrs();
        connected.extend(self.dialing.iter().cloned());

        let plan = discovery::plan_dials(
            self.registry.as_ref(),
            &connected,
            &self.self_addr,
            free,
            now_ms(),
            self.ban_timeout_ms(),
            &mut rand::thread_rng(),
        )?;
        for addr in plan {
            debug!(peer = %addr, "Dialing");
            self.dialing.insert(addr.clone());
            network::spawn_dial(addr, self.events_tx.clone());
        }
        Ok(())
    }

    fn request_sync(&mut self) -> Result<()> {
        self.sync.reached(self.chain.height());
        if self.peers.is_empty() {
            return Ok(());
        }
        if let Some(height) = self.sync.due(Instant::now()) {
            debug!(height, peers = self.peers.len(), "Requesting blocks");
            self.peers.broadcast(&Message::Sync(height), None)?;
        }
        Ok(())
    }
}

fn advertisement(addr: &str) -> Option<NodeAddress> {
    let (host, port) = addr.rsplit_once(':')?;
    Some(NodeAddress {
        host: host.to_string(),
        port: port.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusConfig;
    use crate::persistence::InMemoryPersistence;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.consensus = ConsensusConfig::testing();
        config.network.p2p_port = 0;
        config
    }

    #[test]
    fn test_advertisement_parses_host_port() {
        assert_eq!(
            advertisement("10.0.0.1:7420"),
            Some(NodeAddress { host: "10.0.0.1".to_string(), port: 7420 })
        );
        assert_eq!(advertisement("seed.example"), None);
    }

    #[tokio::test]
    async fn test_handle_queries_and_rejects_known_block() {
        tokio::time::timeout(Duration::from_secs(30), async {
            let store = InMemoryPersistence::new();
            let (node, handle) = Node::new(test_config(), Box::new(store.clone()), Box::new(store)).unwrap();
            let genesis = node.chain().genesis().clone();
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let task = tokio::spawn(node.run(listener));

            let status = handle.status().await.unwrap();
            assert_eq!(status.height, 0);
            assert_eq!(status.tip, genesis.hash_str());
            assert!(!status.mining);

            assert_eq!(handle.balance([9u8; 20]).await.unwrap(), "0");
            let found = handle.block(BlockQuery::Height(0)).await.unwrap().unwrap();
            assert_eq!(found.hash, genesis.hash);
            assert_eq!(
                handle.submit_block(genesis).await.unwrap(),
                Some(Outcome::Rejected("1".to_string()))
            );

            handle.shutdown().await.unwrap();
            task.await.unwrap().unwrap();
            assert!(handle.status().await.is_err());
        })
        .await
        .expect("test_handle_queries_and_rejects_known_block timed out");
    }
}

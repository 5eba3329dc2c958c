use cairnchain::blockchain::Chain;
use cairnchain::config::{Config, ConsensusConfig};
use cairnchain::crypto::{address_to_hex, KeyPair};
use cairnchain::dispatcher::Outcome;
use cairnchain::miner::{mine_block, PauseToken};
use cairnchain::node::{BlockQuery, Node, NodeHandle, NodeStatus};
use cairnchain::now_ms;
use cairnchain::persistence::InMemoryPersistence;
use cairnchain::transaction::Transaction;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn base_config() -> Config {
    let mut config = Config::default();
    config.consensus = ConsensusConfig::testing();
    config.peers.reconnect_interval_secs = 1;
    config.peers.sync_interval_secs = 1;
    config
}

fn mining_config(key: &KeyPair) -> Config {
    let mut config = base_config();
    config.miner.enabled = true;
    config.miner.reward_address = address_to_hex(&key.address());
    config
}

async fn start(config: Config) -> (NodeHandle, JoinHandle<cairnchain::error::Result<()>>, u16) {
    start_with(config, InMemoryPersistence::new()).await
}

async fn start_with(
    config: Config,
    store: InMemoryPersistence,
) -> (NodeHandle, JoinHandle<cairnchain::error::Result<()>>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (node, handle) = Node::new(config, Box::new(store.clone()), Box::new(store)).unwrap();
    (handle, tokio::spawn(node.run(listener)), port)
}

async fn wait_for(handle: &NodeHandle, done: impl Fn(&NodeStatus) -> bool) -> NodeStatus {
    loop {
        let status = handle.status().await.unwrap();
        if done(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocks_propagate_to_a_dialing_peer() {
    tokio::time::timeout(Duration::from_secs(120), async {
        let (miner, miner_task, port) = start(mining_config(&KeyPair::generate())).await;

        let mut follower_config = base_config();
        follower_config.network.bootstrap_peers = vec![format!("127.0.0.1:{}", port)];
        let (follower, follower_task, _) = start(follower_config).await;

        let reached = wait_for(&follower, |s| s.height >= 2).await;
        assert!(reached.outbound >= 1);
        assert!(!reached.mining);

        let ours = follower.block(BlockQuery::Height(2)).await.unwrap().unwrap();
        let theirs = miner.block(BlockQuery::Height(2)).await.unwrap().unwrap();
        assert_eq!(ours.hash, theirs.hash);

        follower.shutdown().await.unwrap();
        miner.shutdown().await.unwrap();
        follower_task.await.unwrap().unwrap();
        miner_task.await.unwrap().unwrap();
    })
    .await
    .expect("test_blocks_propagate_to_a_dialing_peer timed out");
}

/// A store holding `count` blocks on a branch of our own, mined with wide
/// gaps so it carries little work.
fn private_branch(consensus: &ConsensusConfig, count: u64) -> InMemoryPersistence {
    let store = InMemoryPersistence::new();
    let mut chain = Chain::new(consensus.clone(), Box::new(store.clone())).unwrap();
    for _ in 0..count {
        let tip = chain.tip_block().unwrap();
        let template = chain.get_new_block([0x5A; 20], tip.timestamp + 60_000).unwrap();
        let block = mine_block(template, consensus, 8, &PauseToken::new()).unwrap().unwrap();
        chain.add_block(block, now_ms()).unwrap();
    }
    assert_eq!(chain.height(), count);
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_diverged_nodes_converge_on_heavier_chain() {
    tokio::time::timeout(Duration::from_secs(120), async {
        let (miner, miner_task, port) = start(mining_config(&KeyPair::generate())).await;
        wait_for(&miner, |s| s.height >= 4).await;

        let mut config = base_config();
        config.network.bootstrap_peers = vec![format!("127.0.0.1:{}", port)];
        let store = private_branch(&config.consensus, 2);
        let (follower, follower_task, _) = start_with(config, store).await;
        let own = follower.block(BlockQuery::Height(1)).await.unwrap().unwrap();

        // Their blocks only connect at genesis, well below our tip.
        loop {
            let ours = follower.block(BlockQuery::Height(1)).await.unwrap();
            let theirs = miner.block(BlockQuery::Height(1)).await.unwrap();
            if ours.is_some() && ours.map(|b| b.hash) == theirs.map(|b| b.hash) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_ne!(follower.block(BlockQuery::Height(1)).await.unwrap().unwrap().hash, own.hash);
        assert!(follower.status().await.unwrap().height >= 4);
        assert_eq!(miner.balance([0x5A; 20]).await.unwrap(), "0");

        follower.shutdown().await.unwrap();
        miner.shutdown().await.unwrap();
        follower_task.await.unwrap().unwrap();
        miner_task.await.unwrap().unwrap();
    })
    .await
    .expect("test_diverged_nodes_converge_on_heavier_chain timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submitted_transaction_gets_mined() {
    tokio::time::timeout(Duration::from_secs(120), async {
        let key = KeyPair::generate();
        let (node, task, _) = start(mining_config(&key)).await;
        let sender = key.address();
        let recipient = [7u8; 20];

        wait_for(&node, |s| s.height >= 1).await;
        assert_ne!(node.balance(sender).await.unwrap(), "0");

        // Early blocks come in bursts and may carry timestamps slightly ahead
        // of the wall clock; retry until the transaction is not stale.
        loop {
            let tip_height = node.status().await.unwrap().height;
            let tip = node.block(BlockQuery::Height(tip_height)).await.unwrap().unwrap();
            let mut tx = Transaction::new_transfer(sender, recipient, "1", "0.001", now_ms().max(tip.timestamp));
            tx.sign(&key);
            match node.submit_transaction(tx.clone()).await.unwrap() {
                Some(Outcome::Accepted) => {
                    let again = node.submit_transaction(tx).await.unwrap();
                    assert!(matches!(again, Some(Outcome::Rejected(_))), "{:?}", again);
                    break;
                }
                Some(Outcome::Rejected(code)) => assert_eq!(code, "2"),
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        loop {
            if node.balance(recipient).await.unwrap() == "1" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut forged = Transaction::new_transfer(sender, recipient, "1", "0.001", now_ms());
        forged.sign(&KeyPair::generate());
        assert_eq!(
            node.submit_transaction(forged).await.unwrap(),
            Some(Outcome::Invalid("17".to_string()))
        );

        node.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    })
    .await
    .expect("test_submitted_transaction_gets_mined timed out");
}

//! Configuration management for CairnChain

use crate::codec;
use crate::error::{ChainError, Result};
use num_bigint::BigInt;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub peers: PeerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    /// Address other nodes reach us on; used to avoid dialing ourselves.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            p2p_port: default_p2p_port(),
            public_host: default_public_host(),
            bootstrap_peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_data_dir")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    #[serde(default = "default_mining_enabled")]
    pub enabled: bool,
    /// Hex-encoded 20-byte address credited by the coinbase.
    #[serde(default = "default_reward_address")]
    pub reward_address: String,
    /// Nonces tried between two checks of the pause flag.
    #[serde(default = "default_nonce_batch")]
    pub nonce_batch: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: default_mining_enabled(),
            reward_address: default_reward_address(),
            nonce_batch: default_nonce_batch(),
        }
    }
}

/// Consensus parameters. Every node on a network must agree on these.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_precision")]
    pub precision: usize,
    #[serde(default = "default_smoothness")]
    pub smoothness: u32,
    #[serde(default = "default_target_block_time_ms")]
    pub target_block_time_ms: u64,
    #[serde(default = "default_block_reward")]
    pub block_reward: String,
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,
    #[serde(default = "default_block_size_margin")]
    pub block_size_margin: usize,
    #[serde(default = "default_max_transaction_size")]
    pub max_transaction_size: usize,
    #[serde(default = "default_max_clock_desync_ms")]
    pub max_clock_desync_ms: u64,
    #[serde(default = "default_trust_depth")]
    pub trust_depth: u64,
    #[serde(default = "default_genesis_timestamp")]
    pub genesis_timestamp: u64,
    #[serde(default)]
    pub min_fee_per_byte: u64,
    #[serde(default = "default_pow_memory_kib")]
    pub pow_memory_kib: u32,
    #[serde(default = "default_pow_passes")]
    pub pow_passes: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            precision: default_precision(),
            smoothness: default_smoothness(),
            target_block_time_ms: default_target_block_time_ms(),
            block_reward: default_block_reward(),
            max_block_size: default_max_block_size(),
            block_size_margin: default_block_size_margin(),
            max_transaction_size: default_max_transaction_size(),
            max_clock_desync_ms: default_max_clock_desync_ms(),
            trust_depth: default_trust_depth(),
            genesis_timestamp: default_genesis_timestamp(),
            min_fee_per_byte: 0,
            pow_memory_kib: default_pow_memory_kib(),
            pow_passes: default_pow_passes(),
        }
    }
}

impl ConsensusConfig {
    /// Cheap proof-of-work profile for tests and local experiments.
    pub fn testing() -> Self {
        Self {
            pow_memory_kib: 64,
            ..Self::default()
        }
    }

    /// One difficulty step.
    pub fn quantum(&self) -> u64 {
        1u64 << self.smoothness
    }

    pub fn min_difficulty(&self) -> u64 {
        1u64 << self.smoothness
    }

    pub fn max_difficulty(&self) -> u64 {
        64u64 << self.smoothness
    }

    /// Block reward in base units.
    pub fn reward(&self) -> BigInt {
        codec::parse_amount(&self.block_reward, self.precision).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimits {
    pub block: u32,
    pub transaction: u32,
    pub node: u32,
    pub sync: u32,
    pub blocks: u32,
    pub meta: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            block: 20,
            transaction: 200,
            node: 20,
            sync: 10,
            blocks: 10,
            meta: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_max_bytes_in_memory")]
    pub max_bytes_in_memory: usize,
    #[serde(default = "default_max_bytes_per_second")]
    pub max_read_per_second: usize,
    #[serde(default = "default_max_bytes_per_second")]
    pub max_write_per_second: usize,
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default = "default_seen_ttl_secs")]
    pub seen_ttl_secs: u64,
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_ban_timeout_secs")]
    pub ban_timeout_secs: u64,
    #[serde(default = "default_max_outbound")]
    pub max_outbound: usize,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_sync_batch")]
    pub sync_batch: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_bytes_in_memory: default_max_bytes_in_memory(),
            max_read_per_second: default_max_bytes_per_second(),
            max_write_per_second: default_max_bytes_per_second(),
            rate_limits: RateLimits::default(),
            seen_ttl_secs: default_seen_ttl_secs(),
            seen_capacity: default_seen_capacity(),
            prune_interval_secs: default_prune_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            ban_timeout_secs: default_ban_timeout_secs(),
            max_outbound: default_max_outbound(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            sync_batch: default_sync_batch(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_tx_queue_capacity")]
    pub tx_queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tx_queue_capacity: default_tx_queue_capacity(),
        }
    }
}

impl Config {
    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.is_empty() {
            return Err(ChainError::ConfigError("database.path must be set".to_string()));
        }
        let consensus = &self.consensus;
        if consensus.smoothness > 32 {
            return Err(ChainError::ConfigError("consensus.smoothness must be at most 32".to_string()));
        }
        match codec::parse_amount(&consensus.block_reward, consensus.precision) {
            Some(reward) if codec::canonicalize(&reward, consensus.precision) == consensus.block_reward => {}
            _ => {
                return Err(ChainError::ConfigError(format!(
                    "consensus.block_reward {:?} is not a canonical amount",
                    consensus.block_reward
                )))
            }
        }
        if consensus.block_size_margin >= consensus.max_block_size {
            return Err(ChainError::ConfigError(
                "consensus.block_size_margin must be smaller than max_block_size".to_string(),
            ));
        }
        if self.dispatcher.workers == 0 {
            return Err(ChainError::ConfigError("dispatcher.workers must be at least 1".to_string()));
        }
        if self.miner.enabled {
            let bytes = hex::decode(&self.miner.reward_address)
                .map_err(|e| ChainError::ConfigError(format!("miner.reward_address: {}", e)))?;
            if bytes.len() != crate::crypto::ADDRESS_SIZE {
                return Err(ChainError::ConfigError(format!(
                    "miner.reward_address must be {} bytes, got {}",
                    crate::crypto::ADDRESS_SIZE,
                    bytes.len()
                )));
            }
        }
        Ok(())
    }
}

/// Load `path`, falling back to defaults when the file is absent.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let config_str = fs::read_to_string(path.as_ref()).unwrap_or_default();
    let config: Config = if config_str.is_empty() {
        Config::default()
    } else {
        toml::from_str(&config_str)?
    };
    config.validate()?;
    Ok(config)
}

fn default_p2p_port() -> u16 {
    7420
}

fn default_public_host() -> String {
    "127.0.0.1".to_string()
}

fn default_data_dir() -> String {
    "./data/cairn.db".to_string()
}

fn default_mining_enabled() -> bool {
    false
}

fn default_reward_address() -> String {
    "0000000000000000000000000000000000000000".to_string()
}

fn default_nonce_batch() -> u64 {
    16
}

fn default_precision() -> usize {
    8
}

fn default_smoothness() -> u32 {
    4
}

fn default_target_block_time_ms() -> u64 {
    60_000
}

fn default_block_reward() -> String {
    "50".to_string()
}

fn default_max_block_size() -> usize {
    1_000_000
}

fn default_block_size_margin() -> usize {
    1_000
}

fn default_max_transaction_size() -> usize {
    100_000
}

fn default_max_clock_desync_ms() -> u64 {
    60_000
}

fn default_trust_depth() -> u64 {
    64
}

fn default_genesis_timestamp() -> u64 {
    1_672_531_200_000
}

fn default_pow_memory_kib() -> u32 {
    1024
}

fn default_pow_passes() -> u32 {
    1
}

fn default_max_bytes_in_memory() -> usize {
    8 * 1024 * 1024
}

fn default_max_bytes_per_second() -> usize {
    16 * 1024 * 1024
}

fn default_seen_ttl_secs() -> u64 {
    600
}

fn default_seen_capacity() -> usize {
    4096
}

fn default_prune_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_ban_timeout_secs() -> u64 {
    3600
}

fn default_max_outbound() -> usize {
    8
}

fn default_reconnect_interval_secs() -> u64 {
    30
}

fn default_sync_interval_secs() -> u64 {
    5
}

fn default_sync_batch() -> u64 {
    50
}

fn default_workers() -> usize {
    2
}

fn default_tx_queue_capacity() -> usize {
    10_000
}

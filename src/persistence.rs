//! Database persistence layer for CairnChain
//!
//! Two key-value collections sit behind traits so the engine and the peer
//! layer never see SQL: the block store (hash -> minified block without its
//! hash) and the peer registry (host -> `"0"` or a ban timestamp).

use crate::blockchain::{Block, Sha256Hash};
use crate::codec::MinifiedBlock;
use crate::error::{ChainError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub trait BlockStore: Send + Sync {
    fn get_block(&self, hash: &Sha256Hash) -> Result<Option<Block>>;
    fn put_block(&self, block: &Block) -> Result<()>;
    /// Every stored block, in insertion order.
    fn blocks(&self) -> Result<Vec<Block>>;
}

/// Registry value for a known host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Clean,
    BannedAt(u64),
}

impl PeerStatus {
    pub fn to_value(self) -> String {
        match self {
            PeerStatus::Clean => "0".to_string(),
            PeerStatus::BannedAt(ts) => ts.to_string(),
        }
    }

    pub fn from_value(value: &str) -> Result<Self> {
        match value.parse::<u64>() {
            Ok(0) => Ok(PeerStatus::Clean),
            Ok(ts) => Ok(PeerStatus::BannedAt(ts)),
            Err(e) => Err(ChainError::DatabaseError(format!("Invalid peer registry value {:?}: {}", value, e))),
        }
    }

    /// Still inside the ban window at `now_ms`.
    pub fn is_banned(&self, now_ms: u64, ban_timeout_ms: u64) -> bool {
        match self {
            PeerStatus::Clean => false,
            PeerStatus::BannedAt(ts) => now_ms.saturating_sub(*ts) < ban_timeout_ms,
        }
    }
}

pub trait PeerRegistry: Send + Sync {
    fn get_peer(&self, host: &str) -> Result<Option<PeerStatus>>;
    fn put_peer(&self, host: &str, status: PeerStatus) -> Result<()>;
    fn delete_peer(&self, host: &str) -> Result<()>;
    fn peers(&self) -> Result<Vec<(String, PeerStatus)>>;
}

fn encode_block(block: &Block) -> Result<String> {
    Ok(serde_json::to_string(&MinifiedBlock::for_storage(block))?)
}

fn decode_block(hash: Sha256Hash, data: &str) -> Result<Block> {
    let min: MinifiedBlock = serde_json::from_str(data)?;
    min.into_block_with_hash(hash)
}

fn hash_from_column(bytes: Vec<u8>) -> Result<Sha256Hash> {
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ChainError::DatabaseError(format!("Stored hash must be 32 bytes, got {}", b.len())))
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                hash BLOB PRIMARY KEY,
                data TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS peers (
                host TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create peers table: {}", e)))?;

        Ok(Database { conn: Mutex::new(conn) })
    }
}

impl BlockStore for Database {
    fn get_block(&self, hash: &Sha256Hash) -> Result<Option<Block>> {
        let conn = lock(&self.conn)?;
        let data: Option<String> = conn
            .query_row("SELECT data FROM blocks WHERE hash = ?1", params![hash.to_vec()], |row| row.get(0))
            .optional()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to read block: {}", e)))?;
        data.map(|data| decode_block(*hash, &data)).transpose()
    }

    fn put_block(&self, block: &Block) -> Result<()> {
        let data = encode_block(block)?;
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO blocks (hash, data) VALUES (?1, ?2)",
            params![block.hash.to_vec(), data],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;
        Ok(())
    }

    fn blocks(&self) -> Result<Vec<Block>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT hash, data FROM blocks ORDER BY rowid ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let hash: Vec<u8> = row.get(0)?;
                let data: String = row.get(1)?;
                Ok((hash, data))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query blocks: {}", e)))?;

        let mut blocks = Vec::new();
        for row in rows {
            let (hash, data) = row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            blocks.push(decode_block(hash_from_column(hash)?, &data)?);
        }
        Ok(blocks)
    }
}

impl PeerRegistry for Database {
    fn get_peer(&self, host: &str) -> Result<Option<PeerStatus>> {
        let conn = lock(&self.conn)?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM peers WHERE host = ?1", params![host], |row| row.get(0))
            .optional()?;
        value.as_deref().map(PeerStatus::from_value).transpose()
    }

    fn put_peer(&self, host: &str, status: PeerStatus) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO peers (host, value) VALUES (?1, ?2)",
            params![host, status.to_value()],
        )?;
        Ok(())
    }

    fn delete_peer(&self, host: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM peers WHERE host = ?1", params![host])?;
        Ok(())
    }

    fn peers(&self) -> Result<Vec<(String, PeerStatus)>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT host, value FROM peers ORDER BY host ASC")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut peers = Vec::new();
        for row in rows {
            let (host, value) = row?;
            peers.push((host, PeerStatus::from_value(&value)?));
        }
        Ok(peers)
    }
}

/// Simple in-memory store useful for tests and ephemeral runs. Values are
/// kept in their encoded form so both backends exercise the same codec.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    blocks: Arc<Mutex<(Vec<Sha256Hash>, HashMap<Sha256Hash, String>)>>,
    peers: Arc<Mutex<HashMap<String, PeerStatus>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for InMemoryPersistence {
    fn get_block(&self, hash: &Sha256Hash) -> Result<Option<Block>> {
        let blocks = lock(&self.blocks)?;
        blocks.1.get(hash).map(|data| decode_block(*hash, data)).transpose()
    }

    fn put_block(&self, block: &Block) -> Result<()> {
        let data = encode_block(block)?;
        let mut blocks = lock(&self.blocks)?;
        let (order, values) = &mut *blocks;
        if values.insert(block.hash, data).is_none() {
            order.push(block.hash);
        }
        Ok(())
    }

    fn blocks(&self) -> Result<Vec<Block>> {
        let blocks = lock(&self.blocks)?;
        let (order, values) = &*blocks;
        order
            .iter()
            .filter_map(|hash| values.get(hash).map(|data| decode_block(*hash, data)))
            .collect()
    }
}

impl PeerRegistry for InMemoryPersistence {
    fn get_peer(&self, host: &str) -> Result<Option<PeerStatus>> {
        Ok(lock(&self.peers)?.get(host).copied())
    }

    fn put_peer(&self, host: &str, status: PeerStatus) -> Result<()> {
        lock(&self.peers)?.insert(host.to_string(), status);
        Ok(())
    }

    fn delete_peer(&self, host: &str) -> Result<()> {
        lock(&self.peers)?.remove(host);
        Ok(())
    }

    fn peers(&self) -> Result<Vec<(String, PeerStatus)>> {
        let mut peers: Vec<_> = lock(&self.peers)?.iter().map(|(h, s)| (h.clone(), *s)).collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(peers)
    }
}

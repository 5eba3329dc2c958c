//! Chain synchronization for CairnChain
//!
//! A node keeps a set of "sync points": heights it knows it is missing.
//! On an interval it asks every peer for the lowest one; peers answer a
//! `sync(height)` with up to a fixed batch of consecutive canonical blocks.
//!
//! Points at or below the local tip are satisfied and dropped, except the
//! rewind point: when a peer's blocks do not connect to our chain, the node
//! walks its request height back until they do.

use crate::blockchain::{Block, Chain};
use crate::codec::MinifiedBlock;
use crate::error::ChainError;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Sync state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
}

/// Sync statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub requests_sent: u64,
    pub batches_served: u64,
    pub blocks_received: u64,
}

#[derive(Debug)]
pub struct NodeSynchronizer {
    points: BTreeSet<u64>,
    rewind: Option<u64>,
    interval: Duration,
    batch: u64,
    last_request: Option<Instant>,
    stats: SyncStats,
}

impl NodeSynchronizer {
    pub fn new(interval: Duration, batch: u64) -> Self {
        Self {
            points: BTreeSet::new(),
            rewind: None,
            interval,
            batch: batch.max(1),
            last_request: None,
            stats: SyncStats::default(),
        }
    }

    pub fn batch(&self) -> u64 {
        self.batch
    }

    pub fn state(&self) -> SyncState {
        if self.points.is_empty() && self.rewind.is_none() {
            SyncState::Idle
        } else {
            SyncState::Syncing
        }
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn add_point(&mut self, height: u64) {
        self.points.insert(height);
    }

    pub fn points(&self) -> impl Iterator<Item = &u64> {
        self.points.iter()
    }

    pub fn rewind(&self) -> Option<u64> {
        self.rewind
    }

    /// A block at `block_height` arrived whose parent we do not have. Above
    /// the tip we are simply behind; at or below it the peer is on another
    /// branch, so search `trust_depth` lower for a shared ancestor.
    pub fn on_unknown_parent(&mut self, block_height: u64, local_height: u64, trust_depth: u64) {
        if block_height > local_height + 1 {
            self.add_point(local_height + 1);
            return;
        }
        let back = block_height.saturating_sub(trust_depth).max(1);
        self.rewind = Some(self.rewind.map_or(back, |current| current.min(back)));
    }

    /// Drop every point the local chain has reached.
    pub fn reached(&mut self, local_height: u64) {
        self.points.retain(|h| *h > local_height);
    }

    /// The height to request now, if any point is pending and the interval
    /// since the last request has elapsed.
    pub fn due(&mut self, now: Instant) -> Option<u64> {
        let next = match (self.rewind, self.points.iter().next()) {
            (Some(rewind), Some(point)) => rewind.min(*point),
            (Some(rewind), None) => rewind,
            (None, Some(point)) => *point,
            (None, None) => return None,
        };
        if let Some(last) = self.last_request {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_request = Some(now);
        self.stats.requests_sent += 1;
        Some(next)
    }

    /// Blocks to answer a `sync(height)` with.
    pub fn serve(&mut self, chain: &Chain, height: u64) -> Result<Vec<MinifiedBlock>, ChainError> {
        let blocks = chain.blocks_from(height, self.batch)?;
        if !blocks.is_empty() {
            self.stats.batches_served += 1;
        }
        Ok(blocks.iter().map(MinifiedBlock::from_block).collect())
    }

    /// Note a received batch. A full batch means the peer probably has more,
    /// so the height after it becomes a new point. A batch answers any
    /// pending rewind; blocks that still do not connect set a new one.
    pub fn on_batch(&mut self, blocks: &[Block], local_height: u64) {
        self.stats.blocks_received += blocks.len() as u64;
        self.rewind = None;
        if blocks.len() as u64 >= self.batch {
            if let Some(last) = blocks.iter().map(|b| b.height).max() {
                if last < local_height {
                    self.rewind = Some(last + 1);
                } else {
                    self.add_point(last + 1);
                }
            }
        }
    }
}

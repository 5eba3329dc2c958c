//! Proof-of-work search, interruptible between nonce batches

use crate::blockchain::{hash_meets_target, pow_digest, Block};
use crate::config::ConsensusConfig;
use crate::error::ChainError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag the coordinator trips when the canonical tip moves so an
/// in-flight search stops working on a stale template.
#[derive(Debug, Clone, Default)]
pub struct PauseToken(Arc<AtomicBool>);

impl PauseToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Search nonces until the block meets its difficulty target.
///
/// The pause token is checked once per `nonce_batch` nonces; `Ok(None)` means
/// the search was interrupted.
pub fn mine_block(
    mut block: Block,
    consensus: &ConsensusConfig,
    nonce_batch: u64,
    token: &PauseToken,
) -> Result<Option<Block>, ChainError> {
    let header = block.header();
    let target = block.target(consensus);
    let batch = nonce_batch.max(1);

    loop {
        if token.is_paused() {
            return Ok(None);
        }
        for _ in 0..batch {
            let hash = pow_digest(&header, block.nonce, consensus)?;
            if hash_meets_target(&hash, &target) {
                block.hash = hash;
                return Ok(Some(block));
            }
            block.nonce = block.nonce.wrapping_add(1);
        }
    }
}

//! CairnChain - a proof-of-work account ledger node
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Blocks, difficulty, fork choice and the balance cache
//! - [`transaction`] - Transaction types and stateless validation
//! - [`mempool`] - Pending pool and fee-per-byte ordering
//! - [`codec`] - Fixed-point amounts and the minified wire/storage schema
//!
//! ## Consensus
//! - [`miner`] - Interruptible proof-of-work search
//! - [`dispatcher`] - Parallel stateless verification
//!
//! ## Cryptography
//! - [`crypto`] - Recoverable secp256k1 signatures and addresses
//!
//! ## State Management
//! - [`persistence`] - Block store and peer registry (SQLite, in-memory)
//!
//! ## Networking
//! - [`network`] - Framed TCP protocol, sessions, bans and dialing
//! - [`sync`] - Chain synchronization
//! - [`node`] - The coordinator tying it all together
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod codec;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod dispatcher;
pub mod miner;

// ============================================================================
// Cryptography & Security
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

/// Wall-clock milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

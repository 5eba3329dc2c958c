// Thin re-export module: the chain engine lives under `blockchain/core` split
// into block entities, ledger state, link validation and the engine itself.

pub mod core;
pub use core::*;

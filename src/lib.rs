//! ShieldChain - consensus core for a proof-of-work chain with a shielded
//! (JoinSplit) pool and a one-time fork transition
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Block types, block index arena, block acceptor
//! - [`transaction`] - Transaction types, signature hash, validation, builder
//! - [`node`] - Single-writer chain manager
//!
//! ## Consensus
//! - [`consensus`] - Network parameters and consensus constants
//! - [`pow`] - Difficulty retargeting and proof-of-work checks
//! - [`arith`] - Compact target encoding
//! - [`fork`] - Fork-window snapshot validation
//!
//! ## Cryptography
//! - [`crypto`] - JoinSplit signing keys (Ed25519)
//! - [`zk`] - Commitment tree, notes, proof backends
//! - [`encoding`] - Consensus serialization
//!
//! ## State Management
//! - [`persistence`] - Chain-state store (SQLite and in-memory)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod node;
pub mod transaction;

// ============================================================================
// Consensus
// ============================================================================
pub mod arith;
pub mod consensus;
pub mod fork;
pub mod pow;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;
pub mod encoding;
pub mod zk;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use blockchain::{Block, BlockHeader, Blockchain, Collaborators};
pub use error::{ChainError, Rejection, Result};
pub use node::ChainManager;

// Thin re-export module: implementation is in `blockchain/core.rs`, split
// into the acceptor, the block index and the state cache.

pub mod core;
pub use core::*;

// Chain types and the acceptor, the block index arena, and the view cache
// over the chain-state store.
pub mod chain;
pub mod index;
pub mod state;

pub use chain::*;
pub use index::*;
pub use state::*;

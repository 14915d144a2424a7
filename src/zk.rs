//! Shielded pool primitives and the external proving collaborators.
//!
//! The zk-SNARK prover/verifier and the memory-hard puzzle verifier are
//! consumed through the narrow [`ProofBackend`] and [`PuzzleVerifier`] traits
//! so validators can be exercised with mock or digest-based backends.

pub mod backend;
pub mod note;
pub mod tree;

pub use backend::*;
pub use note::*;
pub use tree::*;

/// Arity of a JoinSplit: two shielded inputs and two shielded outputs.
pub const JS_INPUTS: usize = 2;
pub const JS_OUTPUTS: usize = 2;

/// Serialized size of a JoinSplit proof.
pub const PROOF_SIZE: usize = 296;

/// Serialized size of one encrypted output note.
pub const NOTE_CIPHERTEXT_SIZE: usize = 601;

/// Verifies memory-hard proof-of-work puzzle solutions.
///
/// `state` is a BLAKE2b state already personalized for `(n, k)` and fed with
/// the header pre-image and nonce. Implementations must not panic on
/// malformed solutions; they return `false`.
pub trait PuzzleVerifier: Send + Sync {
    fn verify_solution(&self, n: u32, k: u32, state: &blake2b_simd::State, solution: &[u8]) -> bool;
}

/// Accepts every solution. Only meant for regtest chains and tests that
/// exercise everything except the puzzle.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllPuzzles;

impl PuzzleVerifier for AcceptAllPuzzles {
    fn verify_solution(&self, _n: u32, _k: u32, _state: &blake2b_simd::State, _solution: &[u8]) -> bool {
        true
    }
}

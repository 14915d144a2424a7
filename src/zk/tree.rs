//! Incremental Merkle tree over note commitments.
//!
//! Only the frontier (one filled left subtree per level) is stored, which is
//! enough to append and to recompute the root. Each append also yields the
//! authentication path of the leaf it added, valid against the root reached
//! right after that append.

use crate::blockchain::Sha256Hash;
use crate::error::ChainError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const TREE_DEPTH: usize = 29;

/// Roots of empty subtrees, indexed by height. `EMPTY_ROOTS[0]` is the empty
/// leaf and `EMPTY_ROOTS[TREE_DEPTH]` the root of the empty tree.
static EMPTY_ROOTS: Lazy<[Sha256Hash; TREE_DEPTH + 1]> = Lazy::new(|| {
    let mut roots = [[0u8; 32]; TREE_DEPTH + 1];
    for level in 0..TREE_DEPTH {
        roots[level + 1] = combine(&roots[level], &roots[level]);
    }
    roots
});

pub fn combine(left: &Sha256Hash, right: &Sha256Hash) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

pub fn empty_root() -> Sha256Hash {
    EMPTY_ROOTS[TREE_DEPTH]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalMerkleTree {
    size: u64,
    filled: [Sha256Hash; TREE_DEPTH],
    root: Sha256Hash,
}

impl Default for IncrementalMerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalMerkleTree {
    pub const CAPACITY: u64 = 1 << TREE_DEPTH;

    pub fn new() -> Self {
        IncrementalMerkleTree {
            size: 0,
            filled: [[0u8; 32]; TREE_DEPTH],
            root: empty_root(),
        }
    }

    pub fn root(&self) -> Sha256Hash {
        self.root
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn append(&mut self, commitment: Sha256Hash) -> Result<AuthPath, ChainError> {
        if self.size >= Self::CAPACITY {
            return Err(ChainError::InvalidChainState(
                "commitment tree is full".to_string(),
            ));
        }

        let position = self.size;
        let mut index = position;
        let mut current = commitment;
        let mut siblings = [[0u8; 32]; TREE_DEPTH];

        for level in 0..TREE_DEPTH {
            if index & 1 == 0 {
                self.filled[level] = current;
                siblings[level] = EMPTY_ROOTS[level];
                current = combine(&current, &EMPTY_ROOTS[level]);
            } else {
                siblings[level] = self.filled[level];
                current = combine(&self.filled[level], &current);
            }
            index >>= 1;
        }

        self.root = current;
        self.size += 1;
        Ok(AuthPath { position, siblings })
    }
}

/// Position of a leaf plus its sibling at every level, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPath {
    pub position: u64,
    pub siblings: [Sha256Hash; TREE_DEPTH],
}

impl AuthPath {
    /// Path of an unused slot in the empty tree; what dummy inputs carry.
    pub fn empty() -> Self {
        let mut siblings = [[0u8; 32]; TREE_DEPTH];
        siblings.copy_from_slice(&EMPTY_ROOTS[..TREE_DEPTH]);
        AuthPath { position: 0, siblings }
    }

    pub fn root(&self, leaf: &Sha256Hash) -> Sha256Hash {
        let mut current = *leaf;
        for (level, sibling) in self.siblings.iter().enumerate() {
            current = if (self.position >> level) & 1 == 0 {
                combine(&current, sibling)
            } else {
                combine(sibling, &current)
            };
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> Sha256Hash {
        [byte; 32]
    }

    #[test]
    fn test_empty_tree_root() {
        let tree = IncrementalMerkleTree::new();
        assert_eq!(tree.root(), empty_root());
        assert_eq!(tree.size(), 0);
        assert_ne!(empty_root(), [0u8; 32]);
    }

    #[test]
    fn test_root_changes_on_append() {
        let mut tree = IncrementalMerkleTree::new();
        tree.append(leaf(1)).unwrap();
        let after_one = tree.root();
        tree.append(leaf(2)).unwrap();
        assert_ne!(after_one, tree.root());
        assert_ne!(after_one, empty_root());
        assert_eq!(tree.size(), 2);
    }

    #[test]
    fn test_two_leaf_root_matches_manual_hash() {
        let mut tree = IncrementalMerkleTree::new();
        tree.append(leaf(1)).unwrap();
        tree.append(leaf(2)).unwrap();

        let mut expected = combine(&leaf(1), &leaf(2));
        for level in 1..TREE_DEPTH {
            expected = combine(&expected, &EMPTY_ROOTS[level]);
        }
        assert_eq!(tree.root(), expected);
    }

    #[test]
    fn test_auth_path_reproduces_root() {
        let mut tree = IncrementalMerkleTree::new();
        for i in 0..7u8 {
            let path = tree.append(leaf(i)).unwrap();
            assert_eq!(path.position, i as u64);
            assert_eq!(path.root(&leaf(i)), tree.root());
            assert_ne!(path.root(&leaf(i + 100)), tree.root());
        }
    }

    #[test]
    fn test_empty_path_gives_empty_root() {
        assert_eq!(AuthPath::empty().root(&[0u8; 32]), empty_root());
    }

    #[test]
    fn test_tree_survives_bincode() {
        let mut tree = IncrementalMerkleTree::new();
        tree.append(leaf(9)).unwrap();
        let bytes = bincode::serialize(&tree).unwrap();
        let decoded: IncrementalMerkleTree = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, tree);
    }
}

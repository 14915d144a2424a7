use crate::error::ChainError;
use crate::persistence::{
    AnchorsCacheEntry, AnchorsMap, BlockIndexMap, Coin, CoinsCacheEntry, CoinsMap, CoinsView,
    NullifiersCacheEntry, NullifiersMap, StoredBlock, DIRTY, FRESH,
};
use crate::transaction::{OutPoint, Transaction};
use crate::zk::{empty_root, IncrementalMerkleTree};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::chain::Sha256Hash;

/// What it takes to undo a connected block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    /// Coins spent by the block, in the order its inputs spent them.
    pub spent: Vec<Coin>,
    /// Best anchor before the block was connected.
    pub prev_anchor: Sha256Hash,
}

/// Write-back cache over a [`CoinsView`].
///
/// Reads populate the cache; writes only mark entries DIRTY. Nothing reaches
/// the base view until [`flush`](Self::flush), which hands every change to a
/// single `batch_write`.
pub struct CoinsViewCache<'a> {
    base: &'a dyn CoinsView,
    best_block: Option<Sha256Hash>,
    best_anchor: Option<Sha256Hash>,
    coins: CoinsMap,
    anchors: AnchorsMap,
    nullifiers: NullifiersMap,
    blocks: BlockIndexMap,
}

impl<'a> CoinsViewCache<'a> {
    pub fn new(base: &'a dyn CoinsView) -> Self {
        CoinsViewCache {
            base,
            best_block: None,
            best_anchor: None,
            coins: HashMap::new(),
            anchors: HashMap::new(),
            nullifiers: HashMap::new(),
            blocks: HashMap::new(),
        }
    }

    pub fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        if let Some(entry) = self.coins.get(outpoint) {
            return Ok(entry.coin.clone());
        }
        let coin = self.base.get_coin(outpoint)?;
        if let Some(coin) = &coin {
            self.coins.insert(
                *outpoint,
                CoinsCacheEntry {
                    coin: Some(coin.clone()),
                    flags: 0,
                },
            );
        }
        Ok(coin)
    }

    pub fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, ChainError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin) -> Result<(), ChainError> {
        let fresh = match self.coins.get(&outpoint) {
            Some(entry) => entry.flags & FRESH != 0,
            None => !self.base.have_coin(&outpoint)?,
        };
        let flags = if fresh { DIRTY | FRESH } else { DIRTY };
        self.coins.insert(outpoint, CoinsCacheEntry { coin: Some(coin), flags });
        Ok(())
    }

    /// Spends `outpoint`, returning the coin it held.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        let coin = match self.get_coin(outpoint)? {
            Some(coin) => coin,
            None => return Ok(None),
        };
        let fresh = self
            .coins
            .get(outpoint)
            .map(|entry| entry.flags & FRESH != 0)
            .unwrap_or(false);
        if fresh {
            self.coins.remove(outpoint);
        } else {
            self.coins.insert(*outpoint, CoinsCacheEntry { coin: None, flags: DIRTY });
        }
        Ok(Some(coin))
    }

    /// Removes an unspent output without it being spent (disconnect path).
    pub fn remove_coin(&mut self, outpoint: &OutPoint) -> Result<bool, ChainError> {
        Ok(self.spend_coin(outpoint)?.is_some())
    }

    pub fn get_best_block(&self) -> Result<Option<Sha256Hash>, ChainError> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.base.get_best_block(),
        }
    }

    pub fn set_best_block(&mut self, hash: Sha256Hash) {
        self.best_block = Some(hash);
    }

    pub fn get_best_anchor(&self) -> Result<Sha256Hash, ChainError> {
        match self.best_anchor {
            Some(root) => Ok(root),
            None => self.base.get_best_anchor(),
        }
    }

    pub fn get_anchor_at(&mut self, root: &Sha256Hash) -> Result<Option<IncrementalMerkleTree>, ChainError> {
        if let Some(entry) = self.anchors.get(root) {
            return Ok(entry.entered.then(|| entry.tree.clone()));
        }
        let tree = self.base.get_anchor_at(root)?;
        if let Some(tree) = &tree {
            self.anchors.insert(
                *root,
                AnchorsCacheEntry {
                    entered: true,
                    tree: tree.clone(),
                    flags: 0,
                },
            );
        }
        Ok(tree)
    }

    /// Makes `tree` the best anchor. Pushing the current best is a no-op.
    pub fn push_anchor(&mut self, tree: IncrementalMerkleTree) -> Result<(), ChainError> {
        let root = tree.root();
        if root == self.get_best_anchor()? {
            return Ok(());
        }
        self.anchors.insert(
            root,
            AnchorsCacheEntry {
                entered: true,
                tree,
                flags: DIRTY,
            },
        );
        self.best_anchor = Some(root);
        Ok(())
    }

    /// Retires the current best anchor in favour of `new_best`.
    pub fn pop_anchor(&mut self, new_best: Sha256Hash) -> Result<(), ChainError> {
        let current = self.get_best_anchor()?;
        if current == new_best {
            return Ok(());
        }
        // The empty tree is implicit and never removed.
        if current != empty_root() {
            let tree = self.get_anchor_at(&current)?.ok_or_else(|| {
                ChainError::InvalidChainState(format!(
                    "best anchor {} is missing from the store",
                    hex::encode(current)
                ))
            })?;
            self.anchors.insert(
                current,
                AnchorsCacheEntry {
                    entered: false,
                    tree,
                    flags: DIRTY,
                },
            );
        }
        self.best_anchor = Some(new_best);
        Ok(())
    }

    pub fn get_nullifier(&mut self, nullifier: &Sha256Hash) -> Result<bool, ChainError> {
        if let Some(entry) = self.nullifiers.get(nullifier) {
            return Ok(entry.entered);
        }
        let spent = self.base.get_nullifier(nullifier)?;
        self.nullifiers
            .insert(*nullifier, NullifiersCacheEntry { entered: spent, flags: 0 });
        Ok(spent)
    }

    pub fn set_nullifiers(&mut self, tx: &Transaction, spent: bool) {
        for nullifier in tx.nullifiers() {
            self.nullifiers
                .insert(*nullifier, NullifiersCacheEntry { entered: spent, flags: DIRTY });
        }
    }

    /// Whether every transparent input of `tx` refers to an unspent coin.
    pub fn have_inputs(&mut self, tx: &Transaction) -> Result<bool, ChainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        for input in &tx.vin {
            if !self.have_coin(&input.prevout)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Transparent input value plus value leaving the shielded pool.
    pub fn value_in(&mut self, tx: &Transaction) -> Result<Option<i64>, ChainError> {
        if tx.is_coinbase() {
            return Ok(Some(0));
        }
        let mut total = match tx.joinsplit_value_in() {
            Some(total) => total,
            None => return Ok(None),
        };
        for input in &tx.vin {
            let value = match self.get_coin(&input.prevout)? {
                Some(coin) => coin.output.value,
                None => return Ok(None),
            };
            total = match total.checked_add(value) {
                Some(total) => total,
                None => return Ok(None),
            };
        }
        Ok(Some(total))
    }

    /// Anchors known and nullifiers unspent for every JoinSplit of `tx`.
    ///
    /// A descriptor may also anchor to the tree produced by appending the
    /// commitments of earlier descriptors in the same transaction.
    pub fn have_joinsplit_requirements(&mut self, tx: &Transaction) -> Result<bool, ChainError> {
        let mut intermediates: HashMap<Sha256Hash, IncrementalMerkleTree> = HashMap::new();

        for js in &tx.joinsplits {
            for nullifier in &js.nullifiers {
                if self.get_nullifier(nullifier)? {
                    return Ok(false);
                }
            }

            let mut tree = match intermediates.get(&js.anchor) {
                Some(tree) => tree.clone(),
                None => match self.get_anchor_at(&js.anchor)? {
                    Some(tree) => tree,
                    None => return Ok(false),
                },
            };
            for commitment in &js.commitments {
                if tree.append(*commitment).is_err() {
                    return Ok(false);
                }
            }
            intermediates.insert(tree.root(), tree);
        }
        Ok(true)
    }

    /// Queues a block index record for the next flush.
    pub fn put_block(&mut self, hash: Sha256Hash, record: StoredBlock) {
        self.blocks.insert(hash, record);
    }

    /// Writes every change to the base view in one batch. The cache is only
    /// cleared when the batch succeeded.
    pub fn flush(&mut self) -> Result<(), ChainError> {
        let best_anchor = self.get_best_anchor()?;
        self.base.batch_write(
            &self.coins,
            self.best_block,
            &best_anchor,
            &self.anchors,
            &self.nullifiers,
            &self.blocks,
        )?;
        self.coins.clear();
        self.anchors.clear();
        self.nullifiers.clear();
        self.blocks.clear();
        self.best_block = None;
        self.best_anchor = None;
        Ok(())
    }

    pub fn dirty_coin_count(&self) -> usize {
        self.coins.values().filter(|entry| entry.flags & DIRTY != 0).count()
    }
}

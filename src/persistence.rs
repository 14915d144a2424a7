//! Chain-state persistence for ShieldChain
//!
//! Stores spendable coins, shielded nullifiers and commitment-tree anchors
//! together with the best-block and best-anchor pointers and the block
//! index. Every write goes through [`CoinsView::batch_write`], which applies
//! all of it or nothing.

use crate::blockchain::{Block, BlockStatus, BlockUndo, Sha256Hash};
use crate::error::ChainError;
use crate::transaction::{OutPoint, TxOut};
use crate::zk::{empty_root, IncrementalMerkleTree};
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;

/// Entry differs from the parent view and must be written.
pub const DIRTY: u8 = 1 << 0;
/// Parent view does not have this entry, so spending it can simply forget it.
pub const FRESH: u8 = 1 << 1;

const ANCHOR_CACHE_SIZE: usize = 256;

const BEST_BLOCK_KEY: &str = "best_block";
const BEST_ANCHOR_KEY: &str = "best_anchor";

/// An unspent transparent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub output: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinsCacheEntry {
    /// `None` once spent.
    pub coin: Option<Coin>,
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorsCacheEntry {
    pub entered: bool,
    pub tree: IncrementalMerkleTree,
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullifiersCacheEntry {
    pub entered: bool,
    pub flags: u8,
}

/// A block as kept in the block index: body, validity and, while it is on
/// the active chain, its undo data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub height: u32,
    pub status: BlockStatus,
    /// Best anchor after the block was connected; zero if it never was.
    pub hash_anchor_end: Sha256Hash,
    pub undo: Option<BlockUndo>,
    pub block: Block,
}

pub type CoinsMap = HashMap<OutPoint, CoinsCacheEntry>;
pub type AnchorsMap = HashMap<Sha256Hash, AnchorsCacheEntry>;
pub type NullifiersMap = HashMap<Sha256Hash, NullifiersCacheEntry>;
/// Block index records to insert or replace, by block hash.
pub type BlockIndexMap = HashMap<Sha256Hash, StoredBlock>;

/// Read access to chain state plus the atomic batch commit.
pub trait CoinsView: Send + Sync {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, ChainError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    fn get_best_block(&self) -> Result<Option<Sha256Hash>, ChainError>;

    /// Root of the latest commitment tree; the empty root if none was written.
    fn get_best_anchor(&self) -> Result<Sha256Hash, ChainError>;

    /// The tree whose root is `root`. The empty tree is always known.
    fn get_anchor_at(&self, root: &Sha256Hash) -> Result<Option<IncrementalMerkleTree>, ChainError>;

    fn get_nullifier(&self, nullifier: &Sha256Hash) -> Result<bool, ChainError>;

    /// Every stored block index record, parents before children.
    fn load_block_index(&self) -> Result<Vec<StoredBlock>, ChainError>;

    /// Commits every DIRTY entry of the three maps, both pointers and the
    /// block index records as one unit. On error nothing has been applied.
    fn batch_write(
        &self,
        coins: &CoinsMap,
        best_block: Option<Sha256Hash>,
        best_anchor: &Sha256Hash,
        anchors: &AnchorsMap,
        nullifiers: &NullifiersMap,
        blocks: &BlockIndexMap,
    ) -> Result<(), ChainError>;
}

pub struct Database {
    conn: Mutex<Connection>,
    anchor_cache: Mutex<LruCache<Sha256Hash, IncrementalMerkleTree>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChainError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, ChainError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS coins (
                txid BLOB NOT NULL,
                n INTEGER NOT NULL,
                coin BLOB NOT NULL,
                PRIMARY KEY (txid, n)
            );
            CREATE TABLE IF NOT EXISTS anchors (
                root BLOB PRIMARY KEY,
                tree BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS nullifiers (
                nullifier BLOB PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS block_index (
                hash BLOB PRIMARY KEY,
                height INTEGER NOT NULL,
                record BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_block_index_height ON block_index(height);",
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create tables: {}", e)))?;

        let capacity = NonZeroUsize::new(ANCHOR_CACHE_SIZE)
            .ok_or_else(|| ChainError::DatabaseError("anchor cache size is zero".to_string()))?;
        Ok(Database {
            conn: Mutex::new(conn),
            anchor_cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    fn read_hash(&self, key: &str) -> Result<Option<Sha256Hash>, ChainError> {
        let conn = self.lock()?;
        let value: Option<Vec<u8>> = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        value
            .map(|bytes| {
                bytes.try_into().map_err(|_| {
                    ChainError::DatabaseError(format!("Corrupt metadata entry {}", key))
                })
            })
            .transpose()
    }

    /// Number of unspent coins, for status reporting.
    pub fn coin_count(&self) -> Result<u64, ChainError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM coins", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn nullifier_count(&self) -> Result<u64, ChainError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM nullifiers", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn block_count(&self) -> Result<u64, ChainError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM block_index", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn anchor_cache(&self) -> Result<std::sync::MutexGuard<'_, LruCache<Sha256Hash, IncrementalMerkleTree>>, ChainError> {
        self.anchor_cache
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }
}

impl CoinsView for Database {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        let conn = self.lock()?;
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT coin FROM coins WHERE txid = ?1 AND n = ?2",
                params![outpoint.hash.to_vec(), outpoint.n as i64],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_best_block(&self) -> Result<Option<Sha256Hash>, ChainError> {
        self.read_hash(BEST_BLOCK_KEY)
    }

    fn get_best_anchor(&self) -> Result<Sha256Hash, ChainError> {
        Ok(self.read_hash(BEST_ANCHOR_KEY)?.unwrap_or_else(empty_root))
    }

    fn get_anchor_at(&self, root: &Sha256Hash) -> Result<Option<IncrementalMerkleTree>, ChainError> {
        if *root == empty_root() {
            return Ok(Some(IncrementalMerkleTree::new()));
        }
        if let Some(tree) = self.anchor_cache()?.get(root) {
            return Ok(Some(tree.clone()));
        }

        // Refill under the connection lock: batch_write updates the cache
        // before releasing it.
        let conn = self.lock()?;
        let data: Option<Vec<u8>> = conn
            .query_row("SELECT tree FROM anchors WHERE root = ?1", params![root.to_vec()], |row| {
                row.get(0)
            })
            .optional()?;
        let tree: Option<IncrementalMerkleTree> = match data {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        };
        if let Some(tree) = &tree {
            self.anchor_cache()?.put(*root, tree.clone());
        }
        Ok(tree)
    }

    fn get_nullifier(&self, nullifier: &Sha256Hash) -> Result<bool, ChainError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM nullifiers WHERE nullifier = ?1",
                params![nullifier.to_vec()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn load_block_index(&self) -> Result<Vec<StoredBlock>, ChainError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT record FROM block_index ORDER BY height ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(bincode::deserialize(&row?)?);
        }
        Ok(records)
    }

    fn batch_write(
        &self,
        coins: &CoinsMap,
        best_block: Option<Sha256Hash>,
        best_anchor: &Sha256Hash,
        anchors: &AnchorsMap,
        nullifiers: &NullifiersMap,
        blocks: &BlockIndexMap,
    ) -> Result<(), ChainError> {
        let mut conn = self.lock()?;
        // Dropping the transaction without commit rolls everything back.
        let tx = conn
            .transaction()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to start transaction: {}", e)))?;

        let mut written = 0usize;
        for (outpoint, entry) in coins.iter().filter(|(_, e)| e.flags & DIRTY != 0) {
            match &entry.coin {
                Some(coin) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO coins (txid, n, coin) VALUES (?1, ?2, ?3)",
                        params![outpoint.hash.to_vec(), outpoint.n as i64, bincode::serialize(coin)?],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM coins WHERE txid = ?1 AND n = ?2",
                        params![outpoint.hash.to_vec(), outpoint.n as i64],
                    )?;
                }
            }
            written += 1;
        }

        for (root, entry) in anchors.iter().filter(|(_, e)| e.flags & DIRTY != 0) {
            if entry.entered {
                tx.execute(
                    "INSERT OR REPLACE INTO anchors (root, tree) VALUES (?1, ?2)",
                    params![root.to_vec(), bincode::serialize(&entry.tree)?],
                )?;
            } else {
                tx.execute("DELETE FROM anchors WHERE root = ?1", params![root.to_vec()])?;
            }
            written += 1;
        }

        for (nullifier, entry) in nullifiers.iter().filter(|(_, e)| e.flags & DIRTY != 0) {
            if entry.entered {
                tx.execute(
                    "INSERT OR REPLACE INTO nullifiers (nullifier) VALUES (?1)",
                    params![nullifier.to_vec()],
                )?;
            } else {
                tx.execute("DELETE FROM nullifiers WHERE nullifier = ?1", params![nullifier.to_vec()])?;
            }
            written += 1;
        }

        for (hash, record) in blocks {
            tx.execute(
                "INSERT OR REPLACE INTO block_index (hash, height, record) VALUES (?1, ?2, ?3)",
                params![hash.to_vec(), record.height as i64, bincode::serialize(record)?],
            )?;
            written += 1;
        }

        if let Some(best_block) = best_block {
            tx.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                params![BEST_BLOCK_KEY, best_block.to_vec()],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![BEST_ANCHOR_KEY, best_anchor.to_vec()],
        )?;

        tx.commit()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to commit transaction: {}", e)))?;

        // Only committed state may be cached; the connection stays locked
        // until the cache agrees with it.
        let mut cache = self.anchor_cache()?;
        for (root, entry) in anchors.iter().filter(|(_, e)| e.flags & DIRTY != 0) {
            if entry.entered {
                cache.put(*root, entry.tree.clone());
            } else {
                cache.pop(root);
            }
        }
        drop(cache);
        drop(conn);

        debug!("Committed chain state batch ({} entries)", written);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    coins: HashMap<OutPoint, Coin>,
    anchors: HashMap<Sha256Hash, IncrementalMerkleTree>,
    nullifiers: std::collections::HashSet<Sha256Hash>,
    blocks: HashMap<Sha256Hash, StoredBlock>,
    best_block: Option<Sha256Hash>,
    best_anchor: Option<Sha256Hash>,
}

/// In-memory store for tests and ephemeral nodes.
///
/// Batches are applied to a staged copy that replaces the live state only
/// after every operation succeeded. A write fault can be armed to fail a
/// batch after a given number of operations.
#[derive(Default)]
pub struct InMemoryPersistence {
    state: Mutex<MemoryState>,
    fail_after: Mutex<Option<usize>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_fault(after_ops: usize) -> Self {
        let store = Self::new();
        store.set_write_fault(Some(after_ops));
        store
    }

    /// Arms (or with `None` disarms) the simulated I/O fault.
    pub fn set_write_fault(&self, after_ops: Option<usize>) {
        if let Ok(mut fault) = self.fail_after.lock() {
            *fault = after_ops;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, ChainError> {
        self.state
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    pub fn coin_count(&self) -> Result<usize, ChainError> {
        Ok(self.lock()?.coins.len())
    }
}

impl CoinsView for InMemoryPersistence {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        Ok(self.lock()?.coins.get(outpoint).cloned())
    }

    fn get_best_block(&self) -> Result<Option<Sha256Hash>, ChainError> {
        Ok(self.lock()?.best_block)
    }

    fn get_best_anchor(&self) -> Result<Sha256Hash, ChainError> {
        Ok(self.lock()?.best_anchor.unwrap_or_else(empty_root))
    }

    fn get_anchor_at(&self, root: &Sha256Hash) -> Result<Option<IncrementalMerkleTree>, ChainError> {
        if *root == empty_root() {
            return Ok(Some(IncrementalMerkleTree::new()));
        }
        Ok(self.lock()?.anchors.get(root).cloned())
    }

    fn get_nullifier(&self, nullifier: &Sha256Hash) -> Result<bool, ChainError> {
        Ok(self.lock()?.nullifiers.contains(nullifier))
    }

    fn load_block_index(&self) -> Result<Vec<StoredBlock>, ChainError> {
        let mut records: Vec<StoredBlock> = self.lock()?.blocks.values().cloned().collect();
        records.sort_by_key(|record| record.height);
        Ok(records)
    }

    fn batch_write(
        &self,
        coins: &CoinsMap,
        best_block: Option<Sha256Hash>,
        best_anchor: &Sha256Hash,
        anchors: &AnchorsMap,
        nullifiers: &NullifiersMap,
        blocks: &BlockIndexMap,
    ) -> Result<(), ChainError> {
        let fail_after = *self
            .fail_after
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        let mut live = self.lock()?;
        let mut staged = live.clone();
        let mut ops = 0usize;
        let mut step = || -> Result<(), ChainError> {
            if fail_after == Some(ops) {
                return Err(ChainError::DatabaseError(format!(
                    "simulated write fault after {} operations",
                    ops
                )));
            }
            ops += 1;
            Ok(())
        };

        for (outpoint, entry) in coins.iter().filter(|(_, e)| e.flags & DIRTY != 0) {
            step()?;
            match &entry.coin {
                Some(coin) => {
                    staged.coins.insert(*outpoint, coin.clone());
                }
                None => {
                    staged.coins.remove(outpoint);
                }
            }
        }
        for (root, entry) in anchors.iter().filter(|(_, e)| e.flags & DIRTY != 0) {
            step()?;
            if entry.entered {
                staged.anchors.insert(*root, entry.tree.clone());
            } else {
                staged.anchors.remove(root);
            }
        }
        for (nullifier, entry) in nullifiers.iter().filter(|(_, e)| e.flags & DIRTY != 0) {
            step()?;
            if entry.entered {
                staged.nullifiers.insert(*nullifier);
            } else {
                staged.nullifiers.remove(nullifier);
            }
        }
        for (hash, record) in blocks {
            step()?;
            staged.blocks.insert(*hash, record.clone());
        }
        step()?;
        if best_block.is_some() {
            staged.best_block = best_block;
        }
        staged.best_anchor = Some(*best_anchor);

        *live = staged;
        Ok(())
    }
}

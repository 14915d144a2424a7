//! Process-wide owner of the chain: one writer at a time.

use crate::blockchain::{check_block, genesis_block, Block, BlockId, Blockchain, Collaborators, Sha256Hash};
use crate::config::{Config, StorageBackend};
use crate::error::ChainError;
use crate::fork::SnapshotDir;
use crate::persistence::{CoinsView, Database, InMemoryPersistence};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info};

/// Summary of the active tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipInfo {
    pub height: u32,
    pub hash: Sha256Hash,
    pub best_anchor: Sha256Hash,
    pub chain_work: primitive_types::U256,
}

pub struct ChainManager {
    chain: Mutex<Blockchain>,
}

impl ChainManager {
    pub fn new(chain: Blockchain) -> Self {
        ChainManager {
            chain: Mutex::new(chain),
        }
    }

    /// Opens the configured store, reloading the chain it holds or connecting
    /// genesis when it is empty.
    pub fn from_config(config: &Config, collaborators: Collaborators) -> Result<Self, ChainError> {
        let params = config.consensus_params();
        let store: Arc<dyn CoinsView> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(InMemoryPersistence::new()),
            StorageBackend::Sqlite => {
                fs::create_dir_all(&config.storage.data_dir)?;
                let path = config.database_path();
                info!("Opening chain state at {}", path.display());
                Arc::new(Database::open(&path.to_string_lossy())?)
            }
        };

        let collaborators = collaborators.with_snapshots(Arc::new(SnapshotDir::new(config.snapshot_dir())));
        let mut chain = if store.get_best_block()?.is_some() {
            Blockchain::load(params.clone(), store, collaborators)?
        } else {
            let mut chain = Blockchain::new(params.clone(), store, collaborators);
            chain.init_genesis(genesis_block(&params))?;
            chain
        };
        chain.set_checkpoints_enabled(config.fork.checkpoints);
        info!("Chain manager ready on {} network", params.network.as_str());
        Ok(ChainManager::new(chain))
    }

    /// Validates and accepts `block`.
    ///
    /// Context-free checks, proofs included, run before the lock is taken;
    /// connection re-checks anchors and nullifiers against the store, so the
    /// tip moving in between does not invalidate them.
    pub fn process_block(&self, block: Block) -> Result<BlockId, ChainError> {
        let (height, params, collaborators) = {
            let chain = self.chain.lock();
            (
                chain.height_for(&block.header)?,
                chain.params().clone(),
                chain.collaborators().clone(),
            )
        };

        check_block(
            &block,
            height,
            &params,
            collaborators.proofs.as_ref(),
            collaborators.puzzle.as_ref(),
        )?;
        debug!("Block {} passed context-free checks", hex::encode(block.hash()));

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.chain.lock().accept_checked_block(block, now)
    }

    pub fn check_transaction_for_tip(&self, tx: &Transaction) -> Result<(), ChainError> {
        self.chain.lock().check_transaction_for_tip(tx)
    }

    pub fn tip_info(&self) -> Result<Option<TipInfo>, ChainError> {
        let chain = self.chain.lock();
        let tip = match chain.tip() {
            Some(tip) => tip,
            None => return Ok(None),
        };
        let entry = chain.index().get(tip);
        Ok(Some(TipInfo {
            height: entry.height,
            hash: entry.hash,
            best_anchor: chain.store().get_best_anchor()?,
            chain_work: entry.chain_work,
        }))
    }

    /// Runs `f` with the chain locked.
    pub fn with_chain<R>(&self, f: impl FnOnce(&mut Blockchain) -> R) -> R {
        let mut chain = self.chain.lock();
        f(&mut chain)
    }
}

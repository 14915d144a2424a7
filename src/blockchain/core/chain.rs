use crate::consensus::{
    money_range, ConsensusParams, COINBASE_MATURITY, MAX_BLOCK_SIZE, MAX_FUTURE_BLOCK_TIME, MAX_REORG_LENGTH,
};
use crate::encoding::{sha256d, Encodable, Encoder};
use crate::error::{ChainError, Rejection};
use crate::fork::{check_fork_block, NoSnapshots, SnapshotSource};
use crate::persistence::{Coin, CoinsView, StoredBlock};
use crate::pow::{check_proof_of_work, check_puzzle_solution, next_work_required};
use crate::transaction::{check_joinsplits, check_transaction, OutPoint, SigningContext, Transaction, TxOut};
use crate::zk::{AcceptAllPuzzles, DigestProofBackend, ProofBackend, PuzzleVerifier};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::index::{BlockId, BlockStatus, ChainIndex};
use super::state::{BlockUndo, CoinsViewCache};

pub type Sha256Hash = [u8; 32];

pub const BLOCK_VERSION: i32 = 4;

/// Timestamp of every network's genesis block.
pub const GENESIS_TIME: u32 = 1_477_641_360;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Sha256Hash,
    pub merkle_root: Sha256Hash,
    pub reserved_hash: Sha256Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub solution: Vec<u8>,
}

impl Default for BlockHeader {
    fn default() -> Self {
        BlockHeader {
            version: BLOCK_VERSION,
            prev_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            reserved_hash: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: [0u8; 32],
            solution: Vec::new(),
        }
    }
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        sha256d(&self.consensus_bytes())
    }

    /// Header bytes the puzzle commits to: everything but nonce and solution.
    pub fn puzzle_preimage(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(108);
        self.encode_prefix(&mut encoder);
        encoder.into_bytes()
    }

    fn encode_prefix(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_bytes(&self.prev_hash);
        encoder.write_bytes(&self.merkle_root);
        encoder.write_bytes(&self.reserved_hash);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.encode_prefix(encoder);
        encoder.write_bytes(&self.nonce);
        encoder.write_var_bytes(&self.solution);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Wraps `transactions`, filling in the header's merkle root.
    pub fn new(mut header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        header.merkle_root = Block::compute_merkle_root(&transactions);
        Block { header, transactions }
    }

    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    /// Merkle root over txids. An odd level repeats its last entry.
    pub fn compute_merkle_root(transactions: &[Transaction]) -> Sha256Hash {
        let mut level: Vec<Sha256Hash> = transactions.iter().map(Transaction::txid).collect();
        if level.is_empty() {
            return [0u8; 32];
        }
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                let last = level[level.len() - 1];
                level.push(last);
            }
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut joined = [0u8; 64];
                    joined[..32].copy_from_slice(&pair[0]);
                    joined[32..].copy_from_slice(&pair[1]);
                    sha256d(&joined)
                })
                .collect();
        }
        level[0]
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_bytes().len()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        self.transactions.consensus_encode(encoder);
    }
}

/// Genesis block of `params`' network: a single coinbase paying the subsidy
/// to an empty script.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    let coinbase = Transaction::coinbase(0, vec![TxOut::new(params.block_subsidy(0), Vec::new())]);
    let header = BlockHeader {
        time: GENESIS_TIME,
        bits: crate::arith::encode_compact(params.pow_floor(0)),
        ..Default::default()
    };
    Block::new(header, vec![coinbase])
}

/// External collaborators the acceptor calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub proofs: Arc<dyn ProofBackend>,
    pub puzzle: Arc<dyn PuzzleVerifier>,
    pub snapshots: Arc<dyn SnapshotSource>,
}

impl Collaborators {
    /// Digest proofs, no puzzle, no snapshots.
    pub fn regtest() -> Self {
        Collaborators {
            proofs: Arc::new(DigestProofBackend::new()),
            puzzle: Arc::new(AcceptAllPuzzles),
            snapshots: Arc::new(NoSnapshots),
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotSource>) -> Self {
        self.snapshots = snapshots;
        self
    }
}

fn reject(score: u8, reason: &'static str, message: impl Into<String>) -> Rejection {
    Rejection::dos(score, reason, message)
}

fn rejected(score: u8, reason: &'static str, message: impl Into<String>) -> ChainError {
    ChainError::Rejected(reject(score, reason, message))
}

/// Checks that need only the block and its height.
///
/// Touches no chain state, so callers may run it before taking the chain
/// lock. Proofs are verified in parallel across transactions.
pub fn check_block(
    block: &Block,
    height: u32,
    params: &ConsensusParams,
    proofs: &dyn ProofBackend,
    puzzle: &dyn PuzzleVerifier,
) -> Result<(), Rejection> {
    if height > 0 {
        if !check_puzzle_solution(&block.header, params, puzzle) {
            return Err(reject(100, "invalid-solution", "puzzle solution does not verify"));
        }
        if !check_proof_of_work(&block.hash(), block.header.bits, params) {
            return Err(reject(50, "high-hash", "proof of work does not meet the declared target"));
        }
    }

    if Block::compute_merkle_root(&block.transactions) != block.header.merkle_root {
        return Err(reject(100, "bad-txnmrklroot", "merkle root mismatch"));
    }

    if block.transactions.is_empty() || block.serialized_size() > MAX_BLOCK_SIZE {
        return Err(reject(100, "bad-blk-length", "size limits failed"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(reject(100, "bad-cb-missing", "first transaction is not coinbase"));
    }
    // Fork-window blocks redistribute the snapshot as coinbase-shaped transactions.
    let snapshot_shaped = params.is_fork_block(height as i64) && block.transactions.iter().all(Transaction::is_coinbase);
    if !snapshot_shaped && block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(reject(100, "bad-cb-multiple", "more than one coinbase"));
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let ctx = SigningContext::for_height(params, height);
    let failure = block
        .transactions
        .par_iter()
        .map(|tx| check_joinsplits(tx, &ctx, proofs))
        .find_map_first(|result| result.err());
    match failure {
        Some(rejection) => Err(rejection),
        None => Ok(()),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Block acceptor: owns the chain index and decides which branch is active.
///
/// Every change to the store goes through one [`CoinsViewCache`] flush, so a
/// block is either fully connected or not at all.
pub struct Blockchain {
    params: ConsensusParams,
    index: ChainIndex,
    store: Arc<dyn CoinsView>,
    collaborators: Collaborators,
    checkpoints_enabled: bool,
}

impl Blockchain {
    pub fn new(params: ConsensusParams, store: Arc<dyn CoinsView>, collaborators: Collaborators) -> Self {
        Blockchain {
            params,
            index: ChainIndex::new(),
            store,
            collaborators,
            checkpoints_enabled: true,
        }
    }

    pub fn set_checkpoints_enabled(&mut self, enabled: bool) {
        self.checkpoints_enabled = enabled;
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub fn store(&self) -> &dyn CoinsView {
        self.store.as_ref()
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn tip(&self) -> Option<BlockId> {
        self.index.tip()
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.index.tip_height()
    }

    pub fn tip_hash(&self) -> Option<Sha256Hash> {
        self.index.tip().map(|id| self.index.get(id).hash)
    }

    /// Rebuilds the chain from the block index kept in `store`.
    ///
    /// The active chain is the path from the store's best block back to
    /// genesis, which must be this network's genesis block.
    pub fn load(params: ConsensusParams, store: Arc<dyn CoinsView>, collaborators: Collaborators) -> Result<Self, ChainError> {
        let best = store
            .get_best_block()?
            .ok_or_else(|| ChainError::InvalidChainState("store holds no chain to load".to_string()))?;
        let records = store.load_block_index()?;
        let mut chain = Blockchain::new(params, store, collaborators);

        for record in records {
            let id = chain.index.insert(record.block.header.clone());
            let entry = chain.index.get_mut(id);
            if entry.height != record.height {
                return Err(ChainError::InvalidChainState(format!(
                    "block {} stored at height {} links in at height {}",
                    hex::encode(entry.hash),
                    record.height,
                    entry.height
                )));
            }
            entry.status = record.status;
            entry.hash_anchor_end = record.hash_anchor_end;
            entry.undo = record.undo;
            entry.block = Some(Arc::new(record.block));
        }

        let tip = chain
            .index
            .lookup(&best)
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(best)))?;
        let mut path = Vec::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            path.push(id);
            cursor = chain.index.parent(id);
        }
        path.reverse();

        let genesis_hash = genesis_block(&chain.params).hash();
        if path.first().map(|id| chain.index.get(*id).hash) != Some(genesis_hash) {
            return Err(ChainError::InvalidChainState(
                "stored chain does not start at this network's genesis block".to_string(),
            ));
        }
        for id in path {
            let entry = chain.index.get(id);
            if entry.undo.is_none() || entry.status != BlockStatus::Valid {
                return Err(ChainError::InvalidChainState(format!(
                    "active block {} was not stored as connected",
                    hex::encode(entry.hash)
                )));
            }
            chain.index.push_active(id);
        }

        let tip_anchor = chain.index.get(tip).hash_anchor_end;
        if chain.store.get_best_anchor()? != tip_anchor {
            return Err(ChainError::InvalidChainState(
                "store best anchor differs from the tip's anchor".to_string(),
            ));
        }

        info!(
            "Loaded {} blocks, tip {} at height {}",
            chain.index.len(),
            hex::encode(best),
            chain.index.get(tip).height
        );
        Ok(chain)
    }

    /// Connects `block` as height 0 of an empty chain and store.
    pub fn init_genesis(&mut self, block: Block) -> Result<BlockId, ChainError> {
        if !self.index.is_empty() {
            return Err(ChainError::InvalidChainState("genesis already connected".to_string()));
        }
        if let Some(best) = self.store.get_best_block()? {
            return Err(ChainError::InvalidChainState(format!(
                "store already holds chain state up to {}",
                hex::encode(best)
            )));
        }
        if block.header.prev_hash != [0u8; 32] {
            return Err(ChainError::InvalidChainState("genesis must not have a parent".to_string()));
        }

        check_block(
            &block,
            0,
            &self.params,
            self.collaborators.proofs.as_ref(),
            self.collaborators.puzzle.as_ref(),
        )?;

        let id = self.index.insert(block.header.clone());
        self.index.get_mut(id).block = Some(Arc::new(block));
        self.connect_tip(id)?;
        info!("Genesis block {} connected", hex::encode(self.index.get(id).hash));
        Ok(id)
    }

    /// Height the block would have, found through its parent.
    pub fn height_for(&self, header: &BlockHeader) -> Result<u32, ChainError> {
        let parent = self.index.lookup(&header.prev_hash).ok_or(ChainError::OrphanBlock)?;
        Ok(self.index.get(parent).height + 1)
    }

    /// Checks of `header` against its parent `prev` and the clock `now`.
    pub fn contextual_check_block_header(
        &self,
        header: &BlockHeader,
        prev: BlockId,
        now: i64,
    ) -> Result<(), Rejection> {
        let parent = self.index.get(prev);
        let height = parent.height + 1;

        let expected = next_work_required(&self.index, Some(prev), header, &self.params);
        if header.bits != expected {
            return Err(reject(
                100,
                "bad-diffbits",
                format!("bits {:#010x}, expected {:#010x}", header.bits, expected),
            ));
        }

        if header.time as i64 <= self.index.median_time_past(prev) {
            return Err(reject(0, "time-too-old", "block timestamp is not after median time past"));
        }
        if header.time as i64 > now + MAX_FUTURE_BLOCK_TIME {
            return Err(reject(0, "time-too-new", "block timestamp too far in the future"));
        }

        if self.checkpoints_enabled {
            if let Some(expected_hash) = self.params.checkpoints.get(&height) {
                if *expected_hash != header.hash() {
                    return Err(reject(
                        100,
                        "checkpoint-mismatch",
                        format!("block at height {} does not match its checkpoint", height),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Checks of the block body against its parent `prev`.
    pub fn contextual_check_block(&self, block: &Block, prev: BlockId) -> Result<(), Rejection> {
        let height = self.index.get(prev).height + 1;

        // Height commitment in the first coinbase keeps coinbase txids unique.
        let script = block
            .transactions
            .first()
            .and_then(|tx| tx.vin.first())
            .map(|input| input.script_sig.as_slice())
            .unwrap_or_default();
        if !script.starts_with(&height.to_le_bytes()) {
            return Err(reject(100, "bad-cb-height", "block height mismatch in coinbase"));
        }

        check_fork_block(
            block,
            prev,
            &self.index,
            &self.params,
            self.checkpoints_enabled,
            self.collaborators.snapshots.as_ref(),
        )
    }

    pub fn accept_block(&mut self, block: Block) -> Result<BlockId, ChainError> {
        self.accept_block_at(block, unix_now())
    }

    /// Runs every check on `block` and makes it part of the best chain if it
    /// carries the most work.
    pub fn accept_block_at(&mut self, block: Block, now: i64) -> Result<BlockId, ChainError> {
        let height = self.height_for(&block.header)?;
        check_block(
            &block,
            height,
            &self.params,
            self.collaborators.proofs.as_ref(),
            self.collaborators.puzzle.as_ref(),
        )?;
        self.accept_checked_block(block, now)
    }

    /// Like [`accept_block_at`](Self::accept_block_at) for a block that has
    /// already passed [`check_block`] at its height.
    pub fn accept_checked_block(&mut self, block: Block, now: i64) -> Result<BlockId, ChainError> {
        let hash = block.hash();
        if let Some(id) = self.index.lookup(&hash) {
            if self.index.get(id).block.is_some() {
                return Err(ChainError::BlockAlreadyExists);
            }
        }

        let prev = self.index.lookup(&block.header.prev_hash).ok_or(ChainError::OrphanBlock)?;
        if self.index.get(prev).status == BlockStatus::Failed {
            return Err(rejected(100, "bad-prevblk", "previous block is invalid"));
        }

        self.contextual_check_block_header(&block.header, prev, now)?;
        self.contextual_check_block(&block, prev)?;

        let id = self.index.insert(block.header.clone());
        self.index.get_mut(id).block = Some(Arc::new(block));
        self.write_block_records(&[id])?;
        debug!(
            "Accepted block {} at height {}",
            hex::encode(hash),
            self.index.get(id).height
        );

        self.activate_best_chain()?;
        if self.index.get(id).status == BlockStatus::Failed {
            return Err(ChainError::InvalidChainState(format!(
                "block {} was marked invalid",
                hex::encode(hash)
            )));
        }
        Ok(id)
    }

    /// Switches to the valid branch with the most work.
    ///
    /// Disconnects back to the fork point and connects the new branch. A
    /// block that fails to connect is marked failed and the old tip is
    /// restored.
    pub fn activate_best_chain(&mut self) -> Result<(), ChainError> {
        let candidate = match self.index.best_candidate() {
            Some(candidate) => candidate,
            None => return Ok(()),
        };
        let tip = self
            .index
            .tip()
            .ok_or_else(|| ChainError::InvalidChainState("no genesis connected".to_string()))?;
        if candidate == tip {
            return Ok(());
        }

        let fork = self
            .index
            .find_fork(tip, candidate)
            .ok_or_else(|| ChainError::InvalidChainState("branches share no ancestor".to_string()))?;
        let fork_height = self.index.get(fork).height;
        let depth = self.index.get(tip).height - fork_height;
        if depth > MAX_REORG_LENGTH {
            warn!(
                "Refusing reorganization of {} blocks to {}",
                depth,
                hex::encode(self.index.get(candidate).hash)
            );
            if let Some(branch_root) = self.index.ancestor(candidate, fork_height + 1) {
                let failed = self.index.mark_failed(branch_root);
                self.write_block_records(&failed)?;
            }
            return Err(ChainError::ReorgTooDeep { depth, max: MAX_REORG_LENGTH });
        }

        let old_branch: Vec<BlockId> = self.index.active_chain()[(fork_height as usize + 1)..].to_vec();
        let mut new_branch = Vec::new();
        let mut cursor = candidate;
        while cursor != fork {
            new_branch.push(cursor);
            cursor = self
                .index
                .parent(cursor)
                .ok_or_else(|| ChainError::InvalidChainState("candidate branch is detached".to_string()))?;
        }
        new_branch.reverse();

        if depth > 0 {
            info!(
                "Reorganizing: disconnecting {} blocks, connecting {}",
                depth,
                new_branch.len()
            );
        }
        while self.index.tip() != Some(fork) {
            self.disconnect_tip()?;
        }

        for id in new_branch {
            match self.connect_tip(id) {
                Ok(()) => {}
                Err(ChainError::Rejected(rejection)) => {
                    warn!(
                        "Block {} failed to connect: {}",
                        hex::encode(self.index.get(id).hash),
                        rejection
                    );
                    let failed = self.index.mark_failed(id);
                    self.write_block_records(&failed)?;
                    while self.index.tip() != Some(fork) {
                        self.disconnect_tip()?;
                    }
                    for old in &old_branch {
                        self.connect_tip(*old)?;
                    }
                    return Err(ChainError::Rejected(rejection));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Connects the block stored at `id`, which must extend the tip.
    fn connect_tip(&mut self, id: BlockId) -> Result<(), ChainError> {
        let entry = self.index.get(id);
        let block = entry
            .block
            .clone()
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(entry.hash)))?;
        let hash = entry.hash;
        let height = entry.height;
        let parent_hash = entry.parent.map(|p| self.index.get(p).hash);
        if self.index.tip().map(|t| self.index.get(t).hash) != parent_hash {
            return Err(ChainError::InvalidChainState(format!(
                "block {} does not extend the tip",
                hex::encode(hash)
            )));
        }

        let mut view = CoinsViewCache::new(self.store.as_ref());
        if view.get_best_block()? != parent_hash {
            return Err(ChainError::InvalidChainState(
                "store best block differs from the chain tip".to_string(),
            ));
        }

        let prev_anchor = view.get_best_anchor()?;
        let mut tree = view.get_anchor_at(&prev_anchor)?.ok_or_else(|| {
            ChainError::InvalidChainState(format!("best anchor {} is unknown", hex::encode(prev_anchor)))
        })?;
        let mut undo = BlockUndo {
            spent: Vec::new(),
            prev_anchor,
        };
        let mut fees: i64 = 0;

        for tx in block.transactions.iter() {
            let txid = tx.txid();
            for n in 0..tx.vout.len() {
                if view.have_coin(&OutPoint::new(txid, n as u32))? {
                    return Err(rejected(100, "bad-txns-BIP30", "transaction overwrites unspent outputs"));
                }
            }

            if !tx.is_coinbase() {
                let fee = check_tx_inputs(&mut view, tx, height)?;
                fees = fees
                    .checked_add(fee)
                    .filter(|total| money_range(*total))
                    .ok_or_else(|| rejected(100, "bad-txns-fee-outofrange", "block fees out of range"))?;
            }
            if !view.have_joinsplit_requirements(tx)? {
                return Err(rejected(
                    100,
                    "bad-txns-joinsplit-requirements-not-met",
                    format!("transaction {}", hex::encode(txid)),
                ));
            }

            if !tx.is_coinbase() {
                for input in &tx.vin {
                    let coin = view.spend_coin(&input.prevout)?.ok_or_else(|| {
                        ChainError::InvalidChainState("checked input vanished".to_string())
                    })?;
                    undo.spent.push(coin);
                }
            }
            view.set_nullifiers(tx, true);
            for js in &tx.joinsplits {
                for commitment in &js.commitments {
                    tree.append(*commitment)?;
                }
            }
            for (n, output) in tx.vout.iter().enumerate() {
                view.add_coin(
                    OutPoint::new(txid, n as u32),
                    Coin {
                        output: output.clone(),
                        height,
                        is_coinbase: tx.is_coinbase(),
                    },
                )?;
            }
        }

        if !self.params.is_fork_block(height as i64) {
            let reward = block.transactions[0]
                .value_out()
                .ok_or_else(|| rejected(100, "bad-cb-amount", "coinbase value overflows"))?;
            let limit = self.params.block_subsidy(height) + fees;
            if reward > limit {
                return Err(rejected(
                    100,
                    "bad-cb-amount",
                    format!("coinbase pays {} (limit {})", reward, limit),
                ));
            }
        }

        let anchor_end = tree.root();
        view.push_anchor(tree)?;
        view.set_best_block(hash);
        view.put_block(
            hash,
            StoredBlock {
                height,
                status: self.index.get(id).status,
                hash_anchor_end: anchor_end,
                undo: Some(undo.clone()),
                block: (*block).clone(),
            },
        );
        view.flush()?;

        let entry = self.index.get_mut(id);
        entry.undo = Some(undo);
        entry.hash_anchor_end = anchor_end;
        self.index.push_active(id);
        info!(
            "New tip {} at height {} ({} transactions)",
            hex::encode(hash),
            height,
            block.transactions.len()
        );
        Ok(())
    }

    /// Undoes the tip block, moving the tip to its parent.
    pub fn disconnect_tip(&mut self) -> Result<(), ChainError> {
        let tip = self
            .index
            .tip()
            .ok_or_else(|| ChainError::InvalidChainState("empty chain".to_string()))?;
        let entry = self.index.get(tip);
        let parent = entry
            .parent
            .ok_or_else(|| ChainError::InvalidChainState("cannot disconnect genesis".to_string()))?;
        let block = entry
            .block
            .clone()
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(entry.hash)))?;
        let undo = entry
            .undo
            .clone()
            .ok_or_else(|| ChainError::InvalidChainState("tip has no undo data".to_string()))?;
        let hash = entry.hash;
        let parent_hash = self.index.get(parent).hash;

        let mut view = CoinsViewCache::new(self.store.as_ref());
        if view.get_best_block()? != Some(hash) {
            return Err(ChainError::InvalidChainState(
                "store best block differs from the chain tip".to_string(),
            ));
        }

        let mut restored = undo.spent.iter().rev();
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            for n in 0..tx.vout.len() {
                if !view.remove_coin(&OutPoint::new(txid, n as u32))? {
                    warn!("Output {}:{} already missing while disconnecting", hex::encode(txid), n);
                }
            }
            view.set_nullifiers(tx, false);
            if !tx.is_coinbase() {
                for input in tx.vin.iter().rev() {
                    let coin = restored
                        .next()
                        .ok_or_else(|| ChainError::InvalidChainState("undo data exhausted".to_string()))?;
                    view.add_coin(input.prevout, coin.clone())?;
                }
            }
        }
        if restored.next().is_some() {
            return Err(ChainError::InvalidChainState("undo data left over".to_string()));
        }

        view.pop_anchor(undo.prev_anchor)?;
        view.set_best_block(parent_hash);
        let mut record = self.stored_block(tip)?;
        record.undo = None;
        view.put_block(hash, record);
        view.flush()?;

        self.index.get_mut(tip).undo = None;
        self.index.pop_active();
        info!("Disconnected block {}", hex::encode(hash));
        Ok(())
    }

    fn stored_block(&self, id: BlockId) -> Result<StoredBlock, ChainError> {
        let entry = self.index.get(id);
        let block = entry
            .block
            .as_ref()
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(entry.hash)))?;
        Ok(StoredBlock {
            height: entry.height,
            status: entry.status,
            hash_anchor_end: entry.hash_anchor_end,
            undo: entry.undo.clone(),
            block: Block::clone(block),
        })
    }

    /// Persists the index records of `ids` without touching chain state.
    fn write_block_records(&self, ids: &[BlockId]) -> Result<(), ChainError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut view = CoinsViewCache::new(self.store.as_ref());
        for id in ids {
            view.put_block(self.index.get(*id).hash, self.stored_block(*id)?);
        }
        view.flush()
    }

    /// Validates a loose transaction against the current tip without
    /// changing any state.
    pub fn check_transaction_for_tip(&self, tx: &Transaction) -> Result<(), ChainError> {
        if tx.is_coinbase() {
            return Err(rejected(100, "coinbase", "loose coinbase transaction"));
        }
        check_transaction(tx)?;

        let height = self.tip_height().map(|h| h + 1).unwrap_or(0);
        let ctx = SigningContext::for_height(&self.params, height);
        check_joinsplits(tx, &ctx, self.collaborators.proofs.as_ref())?;

        let mut view = CoinsViewCache::new(self.store.as_ref());
        if !view.have_joinsplit_requirements(tx)? {
            return Err(rejected(0, "bad-txns-joinsplit-requirements-not-met", "unknown anchor or spent nullifier"));
        }
        check_tx_inputs(&mut view, tx, height)?;
        Ok(())
    }
}

/// Input existence, maturity and value checks; returns the fee.
fn check_tx_inputs(view: &mut CoinsViewCache<'_>, tx: &Transaction, height: u32) -> Result<i64, ChainError> {
    if !view.have_inputs(tx)? {
        return Err(rejected(100, "bad-txns-inputs-missingorspent", "inputs missing or spent"));
    }

    for input in &tx.vin {
        if let Some(coin) = view.get_coin(&input.prevout)? {
            if coin.is_coinbase && height.saturating_sub(coin.height) < COINBASE_MATURITY {
                return Err(rejected(
                    0,
                    "bad-txns-premature-spend-of-coinbase",
                    format!("coinbase from height {} spent at {}", coin.height, height),
                ));
            }
            if !money_range(coin.output.value) {
                return Err(rejected(100, "bad-txns-inputvalues-outofrange", "input value out of range"));
            }
        }
    }

    let value_in = view
        .value_in(tx)?
        .filter(|value| money_range(*value))
        .ok_or_else(|| rejected(100, "bad-txns-inputvalues-outofrange", "input total out of range"))?;
    let value_out = tx
        .value_out()
        .ok_or_else(|| rejected(100, "bad-txns-txouttotal-toolarge", "output total overflows"))?;
    if value_in < value_out {
        return Err(rejected(
            100,
            "bad-txns-in-belowout",
            format!("value in {} below value out {}", value_in, value_out),
        ));
    }
    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(rejected(100, "bad-txns-fee-outofrange", "fee out of range"));
    }
    Ok(fee)
}

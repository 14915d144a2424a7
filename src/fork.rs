//! Fork-window validation against per-height snapshot files.
//!
//! Blocks inside the fork window redistribute a snapshot of another chain's
//! unspent outputs. Each height has a file of `(amount, script)` records and
//! the block's transactions must reproduce them one for one.

use crate::blockchain::{Block, BlockId, ChainIndex};
use crate::consensus::{ConsensusParams, FORK_CB_PER_BLOCK};
use crate::error::Rejection;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SNAPSHOT_DIR_NAME: &str = "utxo_snapshot";

/// Scripts longer than this are treated as a corrupt record.
pub const MAX_SNAPSHOT_SCRIPT_SIZE: u64 = 10_000;

pub const RECORD_TERMINATOR: u8 = 0x0A;

/// `utxo-%05d.bin` for the offset of `height` from the fork start.
pub fn snapshot_file_name(height: u32, params: &ConsensusParams) -> Option<String> {
    height
        .checked_sub(params.fork_start_height)
        .map(|offset| format!("utxo-{:05}.bin", offset))
}

pub fn default_snapshot_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOT_DIR_NAME)
}

/// Where snapshot files come from.
pub trait SnapshotSource: Send + Sync {
    /// Opens the named snapshot file; `None` when it is absent or unreadable.
    fn open(&self, file_name: &str) -> Option<Box<dyn Read + Send>>;
}

/// Snapshot files in a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    root: PathBuf,
}

impl SnapshotDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SnapshotDir { root: root.into() }
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }
}

impl SnapshotSource for SnapshotDir {
    fn open(&self, file_name: &str) -> Option<Box<dyn Read + Send>> {
        let path = self.path_for(file_name);
        match File::open(&path) {
            Ok(file) => Some(Box::new(BufReader::new(file))),
            Err(e) => {
                debug!("Snapshot file {} unavailable: {}", path.display(), e);
                None
            }
        }
    }
}

/// A source with no files at all; every fork-window check is skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSnapshots;

impl SnapshotSource for NoSnapshots {
    fn open(&self, _file_name: &str) -> Option<Box<dyn Read + Send>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub amount: u64,
    pub script: Vec<u8>,
}

impl SnapshotRecord {
    /// Serialized form, terminator included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(17 + self.script.len());
        bytes.extend_from_slice(&self.amount.to_le_bytes());
        bytes.extend_from_slice(&(self.script.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&self.script);
        bytes.push(RECORD_TERMINATOR);
        bytes
    }
}

/// Records read from one snapshot file.
///
/// `complete` counts records that ended with a terminator byte (correct or
/// resynchronized). A record whose terminator was cut off is still listed in
/// `records` but not counted, so the two disagree for a truncated file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotContents {
    pub records: Vec<SnapshotRecord>,
    pub complete: usize,
}

/// Streaming reader with a one-byte push-back for resynchronization.
pub struct SnapshotReader<R: Read> {
    inner: R,
    pushed_back: Option<u8>,
}

impl<R: Read> SnapshotReader<R> {
    pub fn new(inner: R) -> Self {
        SnapshotReader {
            inner,
            pushed_back: None,
        }
    }

    /// Fills as much of `buf` as the stream allows; returns the byte count.
    fn fill(&mut self, buf: &mut [u8]) -> usize {
        let mut filled = 0;
        if let Some(byte) = self.pushed_back.take() {
            if buf.is_empty() {
                self.pushed_back = Some(byte);
                return 0;
            }
            buf[0] = byte;
            filled = 1;
        }
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Snapshot read error: {}", e);
                    break;
                }
            }
        }
        filled
    }

    fn read_u64(&mut self) -> Option<u64> {
        let mut bytes = [0u8; 8];
        if self.fill(&mut bytes) == 8 {
            Some(u64::from_le_bytes(bytes))
        } else {
            None
        }
    }

    /// Reads up to `limit` records.
    pub fn read_records(&mut self, limit: usize) -> SnapshotContents {
        let mut contents = SnapshotContents::default();

        while contents.complete < limit {
            let amount = match self.read_u64() {
                Some(amount) => amount,
                None => {
                    debug!("Snapshot exhausted after {} records", contents.complete);
                    break;
                }
            };

            let script_len = match self.read_u64() {
                Some(len) => len,
                None => {
                    warn!("Snapshot truncated in script length of record {}", contents.complete);
                    break;
                }
            };
            if script_len > MAX_SNAPSHOT_SCRIPT_SIZE {
                warn!(
                    "Snapshot record {} declares a {} byte script; treating as truncated",
                    contents.complete, script_len
                );
                break;
            }
            if script_len == 0 {
                warn!("Snapshot record {} has an empty script", contents.complete);
            }

            let mut script = vec![0u8; script_len as usize];
            if self.fill(&mut script) != script.len() {
                warn!("Snapshot truncated in script of record {}", contents.complete);
                break;
            }
            contents.records.push(SnapshotRecord { amount, script });

            let mut terminator = [0u8; 1];
            if self.fill(&mut terminator) != 1 {
                warn!("Snapshot truncated before terminator of record {}", contents.complete);
                break;
            }
            if terminator[0] != RECORD_TERMINATOR {
                // Lenient: the byte may already belong to the next record.
                warn!(
                    "Snapshot record {} lacks its terminator (found {:#04x}); resynchronizing",
                    contents.complete, terminator[0]
                );
                self.pushed_back = Some(terminator[0]);
            }
            contents.complete += 1;
        }

        contents
    }
}

/// Compares the block's transactions with the snapshot records.
pub fn verify_fork_block(block: &Block, contents: &SnapshotContents) -> Result<(), Rejection> {
    let tx_count = block.transactions.len();
    if contents.records.len() != tx_count || contents.complete != tx_count {
        return Err(Rejection::dos(
            100,
            "bad-fork-block",
            format!(
                "{} snapshot records ({} complete) for {} transactions",
                contents.records.len(),
                contents.complete,
                tx_count
            ),
        ));
    }

    for (i, (record, tx)) in contents.records.iter().zip(&block.transactions).enumerate() {
        let matches = tx
            .vout
            .first()
            .map(|out| out.value as u64 == record.amount && out.script_pubkey == record.script)
            .unwrap_or(false);
        if !matches {
            warn!("Fork block transaction {} does not match its snapshot record", i);
            return Err(Rejection::dos(
                100,
                "bad-fork-block",
                format!("transaction {} does not match snapshot record", i),
            ));
        }
    }
    Ok(())
}

/// Snapshot check for the block following `prev`.
///
/// Vacuous outside the fork window, below the last checkpoint when
/// checkpoints are enabled, and when the height's file is missing.
pub fn check_fork_block(
    block: &Block,
    prev: BlockId,
    index: &ChainIndex,
    params: &ConsensusParams,
    checkpoints_enabled: bool,
    source: &dyn SnapshotSource,
) -> Result<(), Rejection> {
    let height = index.get(prev).height + 1;
    if !params.is_fork_block(height as i64) {
        return Ok(());
    }

    if checkpoints_enabled {
        if let Some((_, checkpoint_hash)) = params.last_checkpoint() {
            if let Some(checkpoint) = index.lookup(&checkpoint_hash) {
                if index.is_ancestor(prev, checkpoint) {
                    debug!("Fork block at height {} is below the last checkpoint", height);
                    return Ok(());
                }
            }
        }
    }

    let file_name = match snapshot_file_name(height, params) {
        Some(name) => name,
        None => return Ok(()),
    };
    let reader = match source.open(&file_name) {
        Some(reader) => reader,
        None => {
            warn!("Snapshot {} not found; skipping fork check at height {}", file_name, height);
            return Ok(());
        }
    };

    info!(
        "Validating fork block {} at height {} against {}",
        hex::encode(block.hash()),
        height,
        file_name
    );
    let contents = SnapshotReader::new(reader).read_records(FORK_CB_PER_BLOCK);
    info!("{} records read from {}", contents.complete, file_name);
    verify_fork_block(block, &contents)
}

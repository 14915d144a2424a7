//! Reopening a SQLite chain-state store resumes the chain it holds.

mod common;

use common::*;
use shieldchain::blockchain::{BlockStatus, Collaborators};
use shieldchain::config::{Config, StorageBackend};
use shieldchain::node::ChainManager;
use shieldchain::persistence::CoinsView;
use std::path::Path;
use tempfile::TempDir;

fn open(dir: &Path) -> ChainManager {
    let mut config = Config::regtest_in_memory();
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.data_dir = dir.to_path_buf();
    ChainManager::from_config(&config, Collaborators::regtest()).unwrap()
}

#[test]
fn test_reopened_store_resumes_tip_and_branches() {
    let dir = TempDir::new().unwrap();

    let manager = open(dir.path());
    let side_tip = manager.with_chain(|chain| {
        extend(chain, 5, &[0x51]);
        let fork = chain.index().at_height(3).unwrap();
        *extend_branch(chain, fork, 2, &[0x52]).last().unwrap()
    });
    let side_hash = manager.with_chain(|chain| chain.index().get(side_tip).hash);
    let before = manager.tip_info().unwrap().unwrap();
    assert_eq!(before.height, 5);
    drop(manager);

    let manager = open(dir.path());
    assert_eq!(manager.tip_info().unwrap(), Some(before.clone()));
    manager.with_chain(|chain| {
        assert_eq!(chain.index().len(), 8);
        assert_eq!(chain.index().active_chain().len(), 6);
        let side = chain.index().lookup(&side_hash).unwrap();
        assert_eq!(chain.index().get(side).status, BlockStatus::Valid);
        assert!(!chain.index().is_active(side));

        // Overtaking the main chain disconnects blocks connected before the
        // restart, using their stored undo data.
        extend_branch(chain, side, 2, &[0x52]);
        assert_eq!(chain.tip_height(), Some(7));
        assert!(chain.index().is_active(side));
        assert_eq!(chain.store().get_best_block().unwrap(), chain.tip_hash());
    });
    let after = manager.tip_info().unwrap().unwrap();
    drop(manager);

    let manager = open(dir.path());
    assert_eq!(manager.tip_info().unwrap(), Some(after));
    manager.with_chain(|chain| {
        let old_tip = chain.index().lookup(&before.hash).unwrap();
        assert!(!chain.index().is_active(old_tip));
        assert!(chain.index().get(old_tip).undo.is_none());
        extend(chain, 1, &[0x51]);
    });
}

#[test]
fn test_failed_blocks_stay_failed_after_restart() {
    let dir = TempDir::new().unwrap();

    let manager = open(dir.path());
    let greedy_hash = manager.with_chain(|chain| {
        extend(chain, 2, &[0x51]);
        let tip = chain.tip().unwrap();
        let reward = chain.params().block_subsidy(3) + 1;
        let greedy = child_with_reward(chain, tip, &[0x51], reward, Vec::new());
        let hash = greedy.hash();
        assert!(chain.accept_block_at(greedy, NOW).is_err());
        hash
    });
    drop(manager);

    let manager = open(dir.path());
    manager.with_chain(|chain| {
        assert_eq!(chain.tip_height(), Some(2));
        let greedy = chain.index().lookup(&greedy_hash).unwrap();
        assert_eq!(chain.index().get(greedy).status, BlockStatus::Failed);

        let orphaned = child(chain, greedy, &[0x51], Vec::new());
        let err = chain.accept_block_at(orphaned, NOW).unwrap_err();
        assert_eq!(err.rejection().map(|r| r.reason), Some("bad-prevblk"));
    });
}

//! End-to-end shielding: build, validate, mine and connect JoinSplits.

mod common;

use common::*;
use shieldchain::crypto::JoinSplitKeyPair;
use shieldchain::error::ChainError;
use shieldchain::persistence::CoinsView;
use shieldchain::transaction::ShieldingBuilder;
use shieldchain::zk::{empty_root, DigestProofBackend, SpendingKey};

const FEE: i64 = 1_000;

fn reason(err: &ChainError) -> Option<&'static str> {
    err.rejection().map(|r| r.reason)
}

#[test]
fn test_builder_output_is_mined_and_connected() {
    let (mut chain, store) = regtest_chain();
    extend(&mut chain, 101, &[0x51]);
    let params = chain.params().clone();
    let backend = DigestProofBackend::new();

    let spend = coinbase_outpoint(&chain, 1);
    let value = params.block_subsidy(1);
    let mut builder = ShieldingBuilder::new(&params, &backend, 102, store.get_best_anchor().unwrap());
    builder.add_input(spend, value).fee(FEE);
    let transfer = builder.build(SpendingKey::random().paying_key()).unwrap();
    assert_eq!(transfer.note.value, (value - FEE) as u64);

    let tx = transfer.transaction;
    chain.check_transaction_for_tip(&tx).unwrap();

    let tip = chain.tip().unwrap();
    let block = child_with_reward(&chain, tip, &[0x51], params.block_subsidy(102) + FEE, vec![tx.clone()]);
    let id = chain.accept_block_at(block, NOW).unwrap();

    assert_eq!(chain.tip(), Some(id));
    assert!(store.get_coin(&spend).unwrap().is_none());
    for nullifier in tx.nullifiers() {
        assert!(store.get_nullifier(nullifier).unwrap());
    }
    let anchor = store.get_best_anchor().unwrap();
    assert_ne!(anchor, empty_root());
    assert_eq!(store.get_anchor_at(&anchor).unwrap().unwrap().size(), 2);
    assert_eq!(chain.index().get(id).hash_anchor_end, anchor);
}

#[test]
fn test_value_balance_edits_break_the_proof() {
    let (mut chain, _store) = regtest_chain();
    extend(&mut chain, 101, &[0x51]);
    let params = chain.params().clone();
    let backend = DigestProofBackend::new();
    let keypair = JoinSplitKeyPair::generate();

    let spend = coinbase_outpoint(&chain, 1);
    let amount = (params.block_subsidy(1) - FEE) as u64;
    let tx = shield(&backend, &keypair, &params, 102, empty_root(), &[spend], amount);
    chain.check_transaction_for_tip(&tx).unwrap();

    for delta in [1i64, -1] {
        let mut edited = tx.clone();
        edited.joinsplits[0].vpub_old += delta;
        sign(&mut edited, &keypair, &params, 102);
        let err = chain.check_transaction_for_tip(&edited).unwrap_err();
        assert_eq!(reason(&err), Some("bad-txns-joinsplit-verification-failed"));
    }

    // A purely shielded descriptor moving nothing, then claiming one unit out.
    let empty = shield(&backend, &keypair, &params, 102, empty_root(), &[], 0);
    chain.check_transaction_for_tip(&empty).unwrap();
    let mut edited = empty.clone();
    edited.joinsplits[0].vpub_new = 1;
    sign(&mut edited, &keypair, &params, 102);
    let err = chain.check_transaction_for_tip(&edited).unwrap_err();
    assert_eq!(reason(&err), Some("bad-txns-joinsplit-verification-failed"));
}

#[test]
fn test_tampered_block_is_rejected_without_moving_tip() {
    let (mut chain, _store) = regtest_chain();
    extend(&mut chain, 101, &[0x51]);
    let params = chain.params().clone();
    let backend = DigestProofBackend::new();
    let keypair = JoinSplitKeyPair::generate();

    let spend = coinbase_outpoint(&chain, 1);
    let amount = (params.block_subsidy(1) - FEE) as u64;
    let mut tx = shield(&backend, &keypair, &params, 102, empty_root(), &[spend], amount);
    tx.joinsplits[0].commitments[1][0] ^= 1;
    sign(&mut tx, &keypair, &params, 102);

    let tip = chain.tip().unwrap();
    let block = child(&chain, tip, &[0x51], vec![tx]);
    let err = chain.accept_block_at(block, NOW).unwrap_err();
    assert_eq!(reason(&err), Some("bad-txns-joinsplit-verification-failed"));
    assert_eq!(err.rejection().map(|r| r.score), Some(100));
    assert_eq!(chain.tip(), Some(tip));
}

#[test]
fn test_nullifier_cannot_be_spent_twice() {
    let (mut chain, _store) = regtest_chain();
    extend(&mut chain, 102, &[0x51]);
    let params = chain.params().clone();
    let backend = DigestProofBackend::new();
    let keypair = JoinSplitKeyPair::generate();

    let amount = (params.block_subsidy(1) - FEE) as u64;
    let first = shield(&backend, &keypair, &params, 103, empty_root(), &[coinbase_outpoint(&chain, 1)], amount);
    let tip = chain.tip().unwrap();
    let block = child_with_reward(&chain, tip, &[0x51], params.block_subsidy(103) + FEE, vec![first.clone()]);
    chain.accept_block_at(block, NOW).unwrap();

    // Same descriptor, different transparent funding, validly re-signed.
    let mut replay = first;
    replay.vin[0].prevout = coinbase_outpoint(&chain, 2);
    sign(&mut replay, &keypair, &params, 104);

    let err = chain.check_transaction_for_tip(&replay).unwrap_err();
    assert_eq!(reason(&err), Some("bad-txns-joinsplit-requirements-not-met"));

    let tip = chain.tip().unwrap();
    let block = child(&chain, tip, &[0x51], vec![replay]);
    let err = chain.accept_block_at(block, NOW).unwrap_err();
    assert_eq!(reason(&err), Some("bad-txns-joinsplit-requirements-not-met"));
    assert_eq!(chain.tip(), Some(tip));
}

#[test]
fn test_unknown_anchor_is_rejected() {
    let (mut chain, _store) = regtest_chain();
    extend(&mut chain, 101, &[0x51]);
    let params = chain.params().clone();
    let backend = DigestProofBackend::new();
    let keypair = JoinSplitKeyPair::generate();

    let amount = (params.block_subsidy(1) - FEE) as u64;
    let tx = shield(&backend, &keypair, &params, 102, [5u8; 32], &[coinbase_outpoint(&chain, 1)], amount);
    let err = chain.check_transaction_for_tip(&tx).unwrap_err();
    assert_eq!(reason(&err), Some("bad-txns-joinsplit-requirements-not-met"));
}

#[test]
fn test_immature_coinbase_cannot_be_shielded() {
    let (mut chain, _store) = regtest_chain();
    extend(&mut chain, 50, &[0x51]);
    let params = chain.params().clone();
    let backend = DigestProofBackend::new();
    let keypair = JoinSplitKeyPair::generate();

    let amount = (params.block_subsidy(1) - FEE) as u64;
    let tx = shield(&backend, &keypair, &params, 51, empty_root(), &[coinbase_outpoint(&chain, 1)], amount);
    let err = chain.check_transaction_for_tip(&tx).unwrap_err();
    assert_eq!(reason(&err), Some("bad-txns-premature-spend-of-coinbase"));
    assert_eq!(err.rejection().map(|r| r.score), Some(0));
}

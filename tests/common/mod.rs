//! Helpers shared by the integration tests: regtest chains and mining.
#![allow(dead_code)]

use shieldchain::blockchain::{genesis_block, Block, BlockHeader, BlockId, Blockchain, Collaborators, GENESIS_TIME};
use shieldchain::consensus::ConsensusParams;
use shieldchain::crypto::JoinSplitKeyPair;
use shieldchain::persistence::InMemoryPersistence;
use shieldchain::pow::check_proof_of_work;
use shieldchain::transaction::{signature_hash, OutPoint, SigningContext, Transaction, TxIn, TxOut, NOT_AN_INPUT};
use shieldchain::zk::{JoinSplitWitness, JsInput, JsOutput, ProofBackend, SpendingKey};
use std::sync::Arc;

/// Clock far enough ahead that no test block is "too new".
pub const NOW: i64 = GENESIS_TIME as i64 + 100_000_000;

pub const REGTEST_BITS: u32 = 0x200fffff;

pub fn regtest_chain() -> (Blockchain, Arc<InMemoryPersistence>) {
    let params = ConsensusParams::regtest();
    let store = Arc::new(InMemoryPersistence::new());
    let mut chain = Blockchain::new(params.clone(), store.clone(), Collaborators::regtest());
    chain.init_genesis(genesis_block(&params)).expect("genesis connects");
    (chain, store)
}

/// Grinds the nonce until the header meets its own bits.
pub fn mine(mut block: Block, params: &ConsensusParams) -> Block {
    let mut counter: u64 = 0;
    while !check_proof_of_work(&block.hash(), block.header.bits, params) {
        counter += 1;
        block.header.nonce[..8].copy_from_slice(&counter.to_le_bytes());
    }
    block
}

/// Block on top of `parent` with a coinbase paying `reward` to `script`,
/// followed by `extra`.
pub fn child_with_reward(
    chain: &Blockchain,
    parent: BlockId,
    script: &[u8],
    reward: i64,
    extra: Vec<Transaction>,
) -> Block {
    let entry = chain.index().get(parent);
    let height = entry.height + 1;
    let mut transactions = vec![Transaction::coinbase(height, vec![TxOut::new(reward, script.to_vec())])];
    transactions.extend(extra);
    let header = BlockHeader {
        prev_hash: entry.hash,
        time: entry.header.time + 150,
        bits: REGTEST_BITS,
        ..Default::default()
    };
    mine(Block::new(header, transactions), chain.params())
}

pub fn child(chain: &Blockchain, parent: BlockId, script: &[u8], extra: Vec<Transaction>) -> Block {
    let height = chain.index().get(parent).height + 1;
    let reward = chain.params().block_subsidy(height);
    child_with_reward(chain, parent, script, reward, extra)
}

/// Extends the active tip by `count` empty blocks; returns the ids.
pub fn extend(chain: &mut Blockchain, count: usize, script: &[u8]) -> Vec<BlockId> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let tip = chain.tip().expect("chain has a tip");
        let block = child(chain, tip, script, Vec::new());
        ids.push(chain.accept_block_at(block, NOW).expect("block accepted"));
    }
    ids
}

/// Extends `parent` (not necessarily the tip) by `count` blocks, ignoring
/// the acceptance result.
pub fn extend_branch(chain: &mut Blockchain, parent: BlockId, count: usize, script: &[u8]) -> Vec<BlockId> {
    let mut ids = Vec::new();
    let mut prev = parent;
    for _ in 0..count {
        let block = child(chain, prev, script, Vec::new());
        let hash = block.hash();
        let _ = chain.accept_block_at(block, NOW);
        match chain.index().lookup(&hash) {
            Some(id) => {
                ids.push(id);
                prev = id;
            }
            None => break,
        }
    }
    ids
}

/// Outpoint of the coinbase output of the active block at `height`.
pub fn coinbase_outpoint(chain: &Blockchain, height: u32) -> OutPoint {
    let id = chain.index().at_height(height).expect("height is active");
    let block = chain.index().get(id).block.clone().expect("connected block has a body");
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Signs the JoinSplit part of `tx` for a block at `height`.
pub fn sign(tx: &mut Transaction, keypair: &JoinSplitKeyPair, params: &ConsensusParams, height: u32) {
    let ctx = SigningContext::for_height(params, height);
    let sighash = signature_hash(tx, NOT_AN_INPUT, &[], 0, ctx.hash_type(), ctx.branch_id).expect("sighash");
    tx.join_split_sig = keypair.sign(&sighash);
}

/// Shields `value` from `outpoint` (minus `fee`) with a caller-held key pair,
/// so tests can re-sign after editing the transaction.
pub fn shield(
    backend: &dyn ProofBackend,
    keypair: &JoinSplitKeyPair,
    params: &ConsensusParams,
    height: u32,
    anchor: [u8; 32],
    inputs: &[OutPoint],
    amount: u64,
) -> Transaction {
    let witness = JoinSplitWitness {
        inputs: [JsInput::dummy(), JsInput::dummy()],
        outputs: [
            JsOutput::new(SpendingKey::random().paying_key(), amount),
            JsOutput::dummy(),
        ],
        pub_key: keypair.public_key_bytes(),
        anchor,
        vpub_old: amount,
        vpub_new: 0,
    };
    let proven = backend.prove_joinsplit(&witness).expect("balanced witness proves");
    let mut tx = Transaction {
        vin: inputs.iter().map(|outpoint| TxIn::new(*outpoint)).collect(),
        joinsplits: vec![proven.description],
        join_split_pub_key: keypair.public_key_bytes(),
        ..Default::default()
    };
    sign(&mut tx, keypair, params, height);
    tx
}

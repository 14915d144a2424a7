//! Transaction signature hash.
//!
//! BLAKE2b-256 over a transaction digest whose personalization carries the
//! consensus branch id, so a signature made for one epoch never verifies in
//! another.

use crate::encoding::{Encodable, Encoder};
use crate::transaction::types::Transaction;
use blake2b_simd::Params;

/// Input index meaning "sign the transaction as a whole, not an input".
pub const NOT_AN_INPUT: u32 = u32::MAX;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_FORKID: u32 = 0x40;

/// Replay-protection id committed into the hash type once the fork is active.
pub const FORK_ID: u32 = 42;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SighashError {
    #[error("input index {index} out of range for {inputs} inputs")]
    InputIndexOutOfRange { index: u32, inputs: usize },
}

/// Hash type for `SIGHASH_ALL`, with the fork id folded in when `fork_id`.
pub fn hash_type(fork_id: bool) -> u32 {
    if fork_id {
        SIGHASH_ALL | SIGHASH_FORKID | (FORK_ID << 8)
    } else {
        SIGHASH_ALL
    }
}

fn blake2b_256(personal: &[u8; 16], data: &[u8]) -> [u8; 32] {
    let hash = Params::new().hash_length(32).personal(personal).hash(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_bytes());
    out
}

fn prevouts_hash(tx: &Transaction) -> [u8; 32] {
    let mut encoder = Encoder::new();
    for input in &tx.vin {
        input.prevout.consensus_encode(&mut encoder);
    }
    blake2b_256(b"ZcashPrevoutHash", encoder.as_bytes())
}

fn sequence_hash(tx: &Transaction) -> [u8; 32] {
    let mut encoder = Encoder::new();
    for input in &tx.vin {
        encoder.write_u32_le(input.sequence);
    }
    blake2b_256(b"ZcashSequencHash", encoder.as_bytes())
}

fn outputs_hash(tx: &Transaction) -> [u8; 32] {
    let mut encoder = Encoder::new();
    for output in &tx.vout {
        output.consensus_encode(&mut encoder);
    }
    blake2b_256(b"ZcashOutputsHash", encoder.as_bytes())
}

fn joinsplits_hash(tx: &Transaction) -> [u8; 32] {
    if tx.joinsplits.is_empty() {
        return [0u8; 32];
    }
    let mut encoder = Encoder::new();
    for js in &tx.joinsplits {
        js.consensus_encode(&mut encoder);
    }
    encoder.write_bytes(&tx.join_split_pub_key);
    blake2b_256(b"ZcashJSplitsHash", encoder.as_bytes())
}

/// Signature hash of `tx` for input `n_in`, or for the whole transaction when
/// `n_in` is [`NOT_AN_INPUT`]. `script_code` and `amount` only matter for a
/// real input.
pub fn signature_hash(
    tx: &Transaction,
    n_in: u32,
    script_code: &[u8],
    amount: i64,
    hash_type: u32,
    branch_id: u32,
) -> Result<[u8; 32], SighashError> {
    if n_in != NOT_AN_INPUT && n_in as usize >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange {
            index: n_in,
            inputs: tx.vin.len(),
        });
    }

    let zero = [0u8; 32];
    let mut encoder = Encoder::with_capacity(256);
    encoder.write_i32_le(tx.version);
    encoder.write_bytes(&if tx.vin.is_empty() { zero } else { prevouts_hash(tx) });
    encoder.write_bytes(&if tx.vin.is_empty() { zero } else { sequence_hash(tx) });
    encoder.write_bytes(&if tx.vout.is_empty() { zero } else { outputs_hash(tx) });
    encoder.write_bytes(&joinsplits_hash(tx));
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(hash_type);

    if n_in != NOT_AN_INPUT {
        let input = &tx.vin[n_in as usize];
        input.prevout.consensus_encode(&mut encoder);
        encoder.write_var_bytes(script_code);
        encoder.write_i64_le(amount);
        encoder.write_u32_le(input.sequence);
    }

    let mut personal = [0u8; 16];
    personal[..12].copy_from_slice(b"ZcashSigHash");
    personal[12..].copy_from_slice(&branch_id.to_le_bytes());
    Ok(blake2b_256(&personal, encoder.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::types::{OutPoint, TxIn, TxOut};

    fn sample_tx() -> Transaction {
        Transaction {
            vin: vec![TxIn::new(OutPoint::new([1u8; 32], 0))],
            vout: vec![TxOut::new(10, vec![0x51])],
            ..Default::default()
        }
    }

    #[test]
    fn test_branch_id_separates_domains() {
        let tx = sample_tx();
        let a = signature_hash(&tx, NOT_AN_INPUT, &[], 0, SIGHASH_ALL, 0).unwrap();
        let b = signature_hash(&tx, NOT_AN_INPUT, &[], 0, SIGHASH_ALL, 0x4254_4350).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fork_id_changes_hash() {
        let tx = sample_tx();
        let a = signature_hash(&tx, NOT_AN_INPUT, &[], 0, hash_type(false), 0).unwrap();
        let b = signature_hash(&tx, NOT_AN_INPUT, &[], 0, hash_type(true), 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(hash_type(true), 0x2a41);
    }

    #[test]
    fn test_input_index_bounds() {
        let tx = sample_tx();
        assert!(signature_hash(&tx, 0, &[0x51], 10, SIGHASH_ALL, 0).is_ok());
        assert_eq!(
            signature_hash(&tx, 1, &[], 0, SIGHASH_ALL, 0),
            Err(SighashError::InputIndexOutOfRange { index: 1, inputs: 1 })
        );
    }

    #[test]
    fn test_signature_not_covered() {
        let mut tx = sample_tx();
        let before = signature_hash(&tx, NOT_AN_INPUT, &[], 0, SIGHASH_ALL, 0).unwrap();
        tx.join_split_sig[0] = 0xff;
        let after = signature_hash(&tx, NOT_AN_INPUT, &[], 0, SIGHASH_ALL, 0).unwrap();
        assert_eq!(before, after);
    }
}

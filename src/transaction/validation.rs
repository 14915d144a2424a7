/// Context-free transaction checks and shielded descriptor verification
use crate::consensus::{money_range, ConsensusParams, MAX_MONEY, MAX_TX_SIZE};
use crate::crypto::verify_joinsplit_signature;
use crate::error::Rejection;
use crate::transaction::sighash::{hash_type, signature_hash, NOT_AN_INPUT};
use crate::transaction::types::Transaction;
use crate::zk::{JoinSplitPublicInputs, ProofBackend, NOTE_CIPHERTEXT_SIZE, PROOF_SIZE};
use std::collections::HashSet;

/// Signing domain of the block a transaction is mined in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningContext {
    pub branch_id: u32,
    pub fork_id: bool,
}

impl SigningContext {
    pub fn for_height(params: &ConsensusParams, height: u32) -> Self {
        SigningContext {
            branch_id: params.current_epoch_branch_id(height),
            fork_id: params.fork_id_active(height),
        }
    }

    pub fn hash_type(&self) -> u32 {
        hash_type(self.fork_id)
    }
}

fn reject(reason: &'static str, message: impl Into<String>) -> Rejection {
    Rejection::dos(100, reason, message)
}

/// Checks that need nothing but the transaction itself.
pub fn check_transaction(tx: &Transaction) -> Result<(), Rejection> {
    if tx.vin.is_empty() && tx.joinsplits.is_empty() {
        return Err(reject("bad-txns-vin-empty", "transaction has no inputs"));
    }
    if tx.vout.is_empty() && tx.joinsplits.is_empty() {
        return Err(reject("bad-txns-vout-empty", "transaction has no outputs"));
    }
    // Pre-shielded encodings have no room for descriptors, so the txid would
    // not commit to them.
    if tx.version < Transaction::SHIELDED_VERSION && !tx.joinsplits.is_empty() {
        return Err(reject(
            "bad-txns-version-joinsplits",
            format!("version {} transaction carries joinsplits", tx.version),
        ));
    }

    let size = tx.serialized_size();
    if size > MAX_TX_SIZE {
        return Err(reject(
            "bad-txns-oversize",
            format!("size {} exceeds {}", size, MAX_TX_SIZE),
        ));
    }

    let mut value_out: i64 = 0;
    for (i, out) in tx.vout.iter().enumerate() {
        if out.value < 0 {
            return Err(reject("bad-txns-vout-negative", format!("output {} is negative", i)));
        }
        if out.value > MAX_MONEY {
            return Err(reject("bad-txns-vout-toolarge", format!("output {} is too large", i)));
        }
        value_out += out.value;
        if !money_range(value_out) {
            return Err(reject("bad-txns-txouttotal-toolarge", "output total out of range"));
        }
    }

    let mut joinsplit_in: i64 = 0;
    for (i, js) in tx.joinsplits.iter().enumerate() {
        if js.vpub_old < 0 {
            return Err(reject("bad-txns-vpub_old-negative", format!("joinsplit {}", i)));
        }
        if js.vpub_new < 0 {
            return Err(reject("bad-txns-vpub_new-negative", format!("joinsplit {}", i)));
        }
        if js.vpub_old > MAX_MONEY {
            return Err(reject("bad-txns-vpub_old-toolarge", format!("joinsplit {}", i)));
        }
        if js.vpub_new > MAX_MONEY {
            return Err(reject("bad-txns-vpub_new-toolarge", format!("joinsplit {}", i)));
        }
        if js.vpub_old != 0 && js.vpub_new != 0 {
            return Err(reject("bad-txns-vpubs-both-nonzero", format!("joinsplit {}", i)));
        }
        if js.proof.len() != PROOF_SIZE
            || js.ciphertexts.iter().any(|c| c.len() != NOTE_CIPHERTEXT_SIZE)
        {
            return Err(reject("bad-txns-joinsplit-size", format!("joinsplit {}", i)));
        }

        value_out += js.vpub_old;
        if !money_range(value_out) {
            return Err(reject("bad-txns-txouttotal-toolarge", "output total out of range"));
        }
        joinsplit_in += js.vpub_new;
        if !money_range(joinsplit_in) {
            return Err(reject("bad-txns-txintotal-toolarge", "joinsplit input total out of range"));
        }
    }

    let mut seen_outpoints = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen_outpoints.insert(input.prevout) {
            return Err(reject("bad-txns-inputs-duplicate", "input spent twice"));
        }
    }

    let mut seen_nullifiers = HashSet::new();
    for nullifier in tx.nullifiers() {
        if !seen_nullifiers.insert(*nullifier) {
            return Err(reject(
                "bad-joinsplits-nullifiers-duplicate",
                format!("nullifier {} repeated", hex::encode(nullifier)),
            ));
        }
    }

    if tx.is_coinbase() {
        if !tx.joinsplits.is_empty() {
            return Err(reject("bad-cb-has-joinsplits", "coinbase carries joinsplits"));
        }
        let len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(reject("bad-cb-length", format!("coinbase script is {} bytes", len)));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(reject("bad-txns-prevout-null", "non-coinbase input spends the null outpoint"));
    }

    Ok(())
}

/// Verifies the JoinSplit signature and every descriptor's proof.
///
/// Touches no chain state, so the verdict depends only on the transaction
/// bytes, `ctx` and the backend.
pub fn check_joinsplits(
    tx: &Transaction,
    ctx: &SigningContext,
    backend: &dyn ProofBackend,
) -> Result<(), Rejection> {
    if tx.joinsplits.is_empty() {
        return Ok(());
    }

    // Empty script code: the hash covers the transaction, not one input.
    let sighash = signature_hash(tx, NOT_AN_INPUT, &[], 0, ctx.hash_type(), ctx.branch_id)
        .map_err(|e| reject("error-computing-signature-hash", e.to_string()))?;

    verify_joinsplit_signature(&tx.join_split_pub_key, &sighash, &tx.join_split_sig)
        .map_err(|e| reject("bad-txns-invalid-joinsplit-signature", e.to_string()))?;

    for (i, js) in tx.joinsplits.iter().enumerate() {
        let inputs = JoinSplitPublicInputs::from_description(js, &tx.join_split_pub_key);
        if !backend.verify_joinsplit(&js.proof, &inputs) {
            return Err(reject(
                "bad-txns-joinsplit-verification-failed",
                format!("joinsplit {} of {}", i, tx.txid_hex()),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::JoinSplitKeyPair;
    use crate::transaction::types::{JoinSplitDescription, OutPoint, TxIn, TxOut};
    use crate::zk::{
        empty_root, DigestProofBackend, JoinSplitWitness, JsInput, JsOutput, ProvenJoinSplit,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        verdict: bool,
        calls: AtomicUsize,
    }

    impl CountingBackend {
        fn new(verdict: bool) -> Self {
            CountingBackend { verdict, calls: AtomicUsize::new(0) }
        }
    }

    impl ProofBackend for CountingBackend {
        fn prove_joinsplit(&self, _witness: &JoinSplitWitness) -> Result<ProvenJoinSplit, crate::zk::ProofError> {
            unreachable!("validators never prove")
        }

        fn verify_joinsplit(&self, _proof: &[u8], _inputs: &JoinSplitPublicInputs) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
        }
    }

    fn ctx() -> SigningContext {
        SigningContext::for_height(&ConsensusParams::regtest(), 1)
    }

    fn sign(tx: &mut Transaction, keypair: &JoinSplitKeyPair, ctx: &SigningContext) {
        let hash = signature_hash(tx, NOT_AN_INPUT, &[], 0, ctx.hash_type(), ctx.branch_id).unwrap();
        tx.join_split_sig = keypair.sign(&hash);
    }

    fn shielding_tx(amount: u64) -> (Transaction, JoinSplitKeyPair) {
        let keypair = JoinSplitKeyPair::generate();
        let witness = JoinSplitWitness {
            inputs: [JsInput::dummy(), JsInput::dummy()],
            outputs: [JsOutput::new([5u8; 32], amount), JsOutput::dummy()],
            pub_key: keypair.public_key_bytes(),
            anchor: empty_root(),
            vpub_old: amount,
            vpub_new: 0,
        };
        let proven = DigestProofBackend.prove_joinsplit(&witness).unwrap();
        let mut tx = Transaction {
            vin: vec![TxIn::new(OutPoint::new([1u8; 32], 0))],
            vout: vec![],
            joinsplits: vec![proven.description],
            join_split_pub_key: keypair.public_key_bytes(),
            ..Default::default()
        };
        sign(&mut tx, &keypair, &ctx());
        (tx, keypair)
    }

    /// Applies `edit` and re-signs, so only the proof can object.
    fn tamper_and_resign(
        tx: &Transaction,
        keypair: &JoinSplitKeyPair,
        edit: impl FnOnce(&mut JoinSplitDescription),
    ) -> Transaction {
        let mut tampered = tx.clone();
        edit(&mut tampered.joinsplits[0]);
        sign(&mut tampered, keypair, &ctx());
        tampered
    }

    #[test]
    fn test_no_descriptors_is_vacuous() {
        let tx = Transaction::coinbase(1, vec![TxOut::new(5, vec![])]);
        let backend = CountingBackend::new(false);
        assert!(check_joinsplits(&tx, &ctx(), &backend).is_ok());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_valid_shielding_tx_passes() {
        let (tx, _) = shielding_tx(40);
        assert!(check_transaction(&tx).is_ok());
        assert!(check_joinsplits(&tx, &ctx(), &DigestProofBackend).is_ok());
    }

    #[test]
    fn test_signature_byte_flip_reports_signature() {
        let (tx, _) = shielding_tx(40);
        for position in [0usize, 17, 31, 32, 63] {
            let mut broken = tx.clone();
            broken.join_split_sig[position] ^= 0x01;
            let backend = CountingBackend::new(false);
            let err = check_joinsplits(&broken, &ctx(), &backend).unwrap_err();
            assert_eq!(err.reason, "bad-txns-invalid-joinsplit-signature");
            assert_eq!(err.score, 100);
            assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_signature_is_bound_to_branch() {
        let (tx, _) = shielding_tx(40);
        let other_epoch = SigningContext { branch_id: 0x1234_5678, fork_id: false };
        let err = check_joinsplits(&tx, &other_epoch, &DigestProofBackend).unwrap_err();
        assert_eq!(err.reason, "bad-txns-invalid-joinsplit-signature");
    }

    #[test]
    fn test_every_signature_byte_is_checked() {
        let (tx, _) = shielding_tx(40);
        for position in 0..tx.join_split_sig.len() {
            let mut broken = tx.clone();
            broken.join_split_sig[position] ^= 0x80;
            let err = check_joinsplits(&broken, &ctx(), &DigestProofBackend).unwrap_err();
            assert_eq!(err.reason, "bad-txns-invalid-joinsplit-signature", "byte {}", position);
        }
    }

    #[test]
    fn test_changed_proof_inputs_fail_verification() {
        let (tx, keypair) = shielding_tx(40);
        let edits: Vec<Box<dyn Fn(&mut JoinSplitDescription)>> = vec![
            Box::new(|js| js.anchor[0] ^= 1),
            Box::new(|js| js.nullifiers[0][0] ^= 1),
            Box::new(|js| js.nullifiers[1][3] ^= 1),
            Box::new(|js| js.commitments[0][31] ^= 1),
            Box::new(|js| js.commitments[1][12] ^= 1),
            Box::new(|js| js.macs[0][2] ^= 1),
            Box::new(|js| js.macs[1][30] ^= 1),
            Box::new(|js| js.ephemeral_key[5] ^= 1),
            Box::new(|js| js.random_seed[9] ^= 1),
            Box::new(|js| js.vpub_old += 1),
            Box::new(|js| js.vpub_old -= 1),
            Box::new(|js| js.vpub_new += 1),
        ];
        for (i, edit) in edits.into_iter().enumerate() {
            let tampered = tamper_and_resign(&tx, &keypair, |js| edit(js));
            let err = check_joinsplits(&tampered, &ctx(), &DigestProofBackend).unwrap_err();
            assert_eq!(err.reason, "bad-txns-joinsplit-verification-failed", "edit {}", i);
        }
    }

    #[test]
    fn test_swapped_signing_key_fails_verification() {
        let (tx, _) = shielding_tx(40);
        let other = JoinSplitKeyPair::generate();
        let mut swapped = tx.clone();
        swapped.join_split_pub_key = other.public_key_bytes();
        sign(&mut swapped, &other, &ctx());

        // The signature is valid for the new key, but h_sig no longer matches.
        let err = check_joinsplits(&swapped, &ctx(), &DigestProofBackend).unwrap_err();
        assert_eq!(err.reason, "bad-txns-joinsplit-verification-failed");
    }

    #[test]
    fn test_pre_shielded_version_cannot_carry_joinsplits() {
        let (tx, keypair) = shielding_tx(40);
        let mut legacy = tx.clone();
        legacy.version = 1;
        sign(&mut legacy, &keypair, &ctx());

        let mut stripped = legacy.clone();
        stripped.joinsplits.clear();
        assert_eq!(legacy.txid(), stripped.txid());

        let err = check_transaction(&legacy).unwrap_err();
        assert_eq!(err.reason, "bad-txns-version-joinsplits");
        assert_eq!(err.score, 100);
        assert!(check_transaction(&tx).is_ok());
    }

    #[test]
    fn test_check_transaction_reason_codes() {
        let (base, _) = shielding_tx(40);

        let mut tx = base.clone();
        tx.joinsplits[0].vpub_new = 1;
        assert_eq!(check_transaction(&tx).unwrap_err().reason, "bad-txns-vpubs-both-nonzero");

        let mut tx = base.clone();
        tx.joinsplits[0].vpub_old = -1;
        assert_eq!(check_transaction(&tx).unwrap_err().reason, "bad-txns-vpub_old-negative");

        let mut tx = base.clone();
        tx.joinsplits[0].proof.pop();
        assert_eq!(check_transaction(&tx).unwrap_err().reason, "bad-txns-joinsplit-size");

        let mut tx = base.clone();
        let dup = tx.joinsplits[0].nullifiers[0];
        tx.joinsplits[0].nullifiers[1] = dup;
        assert_eq!(
            check_transaction(&tx).unwrap_err().reason,
            "bad-joinsplits-nullifiers-duplicate"
        );

        let mut tx = base.clone();
        tx.vin.push(tx.vin[0].clone());
        assert_eq!(check_transaction(&tx).unwrap_err().reason, "bad-txns-inputs-duplicate");

        let mut tx = base;
        tx.vin.push(TxIn::new(OutPoint::null()));
        assert_eq!(check_transaction(&tx).unwrap_err().reason, "bad-txns-prevout-null");
    }

    #[test]
    fn test_coinbase_rules() {
        let mut cb = Transaction::coinbase(1, vec![TxOut::new(5, vec![])]);
        assert!(check_transaction(&cb).is_ok());

        cb.vin[0].script_sig = vec![0x01];
        assert_eq!(check_transaction(&cb).unwrap_err().reason, "bad-cb-length");

        let mut cb = Transaction::coinbase(1, vec![TxOut::new(-5, vec![])]);
        assert_eq!(check_transaction(&cb).unwrap_err().reason, "bad-txns-vout-negative");
        cb.vout[0].value = MAX_MONEY + 1;
        assert_eq!(check_transaction(&cb).unwrap_err().reason, "bad-txns-vout-toolarge");

        let empty = Transaction::default();
        assert_eq!(check_transaction(&empty).unwrap_err().reason, "bad-txns-vin-empty");
    }
}

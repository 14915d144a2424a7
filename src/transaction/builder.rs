/// Builder for transactions moving transparent coins into the shielded pool
use crate::blockchain::Sha256Hash;
use crate::consensus::{money_range, ConsensusParams};
use crate::crypto::{verify_joinsplit_signature, JoinSplitKeyPair};
use crate::transaction::sighash::{signature_hash, SighashError, NOT_AN_INPUT};
use crate::transaction::types::{OutPoint, Transaction, TxIn};
use crate::transaction::validation::SigningContext;
use crate::zk::{
    JoinSplitPublicInputs, JoinSplitWitness, JsInput, JsOutput, Note, ProofBackend, ProofError,
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("no transparent inputs to shield")]
    NoInputs,
    #[error("anchor must not be null")]
    NullAnchor,
    #[error("input value {0} is out of range")]
    InvalidInputValue(i64),
    #[error("insufficient funds: {available} available, fee is {fee}")]
    InsufficientFunds { available: i64, fee: i64 },
    #[error("proving failed: {0}")]
    Proof(#[from] ProofError),
    #[error("signature hash failed: {0}")]
    Sighash(#[from] SighashError),
    #[error("freshly built proof does not verify")]
    ProofSelfCheck,
    #[error("freshly made signature does not verify")]
    SignatureSelfCheck,
}

/// Result of a shielding operation: the signed transaction and the note it
/// created for the recipient.
#[derive(Debug, Clone)]
pub struct ShieldedTransfer {
    pub transaction: Transaction,
    pub note: Note,
}

/// Spends transparent coins into a single shielded note.
///
/// The JoinSplit uses two zero-value dummy inputs, one real output worth the
/// inputs minus the fee, and one zero-value dummy output. The transaction is
/// signed for the epoch of `next_height`.
pub struct ShieldingBuilder<'a> {
    params: &'a ConsensusParams,
    backend: &'a dyn ProofBackend,
    next_height: u32,
    anchor: Sha256Hash,
    inputs: Vec<(OutPoint, i64)>,
    fee: i64,
}

impl<'a> ShieldingBuilder<'a> {
    pub fn new(params: &'a ConsensusParams, backend: &'a dyn ProofBackend, next_height: u32, anchor: Sha256Hash) -> Self {
        ShieldingBuilder {
            params,
            backend,
            next_height,
            anchor,
            inputs: Vec::new(),
            fee: 0,
        }
    }

    pub fn add_input(&mut self, outpoint: OutPoint, value: i64) -> &mut Self {
        self.inputs.push((outpoint, value));
        self
    }

    pub fn fee(&mut self, fee: i64) -> &mut Self {
        self.fee = fee;
        self
    }

    pub fn build(&self, recipient: Sha256Hash) -> Result<ShieldedTransfer, BuilderError> {
        if self.inputs.is_empty() {
            return Err(BuilderError::NoInputs);
        }
        if self.anchor == [0u8; 32] {
            return Err(BuilderError::NullAnchor);
        }

        let mut available: i64 = 0;
        for (_, value) in &self.inputs {
            if !money_range(*value) {
                return Err(BuilderError::InvalidInputValue(*value));
            }
            available += value;
            if !money_range(available) {
                return Err(BuilderError::InvalidInputValue(available));
            }
        }
        if self.fee < 0 || available <= self.fee {
            return Err(BuilderError::InsufficientFunds { available, fee: self.fee });
        }
        let amount = (available - self.fee) as u64;

        let keypair = JoinSplitKeyPair::generate();
        let pub_key = keypair.public_key_bytes();

        let witness = JoinSplitWitness {
            inputs: [JsInput::dummy(), JsInput::dummy()],
            outputs: [JsOutput::new(recipient, amount), JsOutput::dummy()],
            pub_key,
            anchor: self.anchor,
            vpub_old: amount,
            vpub_new: 0,
        };
        let proven = self.backend.prove_joinsplit(&witness)?;

        let public_inputs = JoinSplitPublicInputs::from_description(&proven.description, &pub_key);
        if !self.backend.verify_joinsplit(&proven.description.proof, &public_inputs) {
            return Err(BuilderError::ProofSelfCheck);
        }

        let [note, _dummy] = proven.output_notes;
        let mut tx = Transaction {
            vin: self.inputs.iter().map(|(outpoint, _)| TxIn::new(*outpoint)).collect(),
            joinsplits: vec![proven.description],
            join_split_pub_key: pub_key,
            ..Default::default()
        };

        let ctx = SigningContext::for_height(self.params, self.next_height);
        let sighash = signature_hash(&tx, NOT_AN_INPUT, &[], 0, ctx.hash_type(), ctx.branch_id)?;
        tx.join_split_sig = keypair.sign(&sighash);
        verify_joinsplit_signature(&pub_key, &sighash, &tx.join_split_sig)
            .map_err(|_| BuilderError::SignatureSelfCheck)?;

        debug!(
            "Built shielding transaction {} moving {} into the shielded pool (fee {})",
            tx.txid_hex(),
            amount,
            self.fee
        );
        Ok(ShieldedTransfer { transaction: tx, note })
    }
}

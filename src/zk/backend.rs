//! JoinSplit proving interface and the deterministic digest backend.

use super::note::{derive_rho, h_sig, random_bytes32, Note, SpendingKey};
use super::tree::AuthPath;
use super::{JS_INPUTS, JS_OUTPUTS, NOTE_CIPHERTEXT_SIZE, PROOF_SIZE};
use crate::blockchain::Sha256Hash;
use crate::encoding::Encoder;
use crate::transaction::JoinSplitDescription;
use blake2b_simd::Params;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("inputs ({inputs}) do not balance outputs ({outputs})")]
    Unbalanced { inputs: u64, outputs: u64 },
    #[error("value sum overflows")]
    ValueOverflow,
    #[error("public value {0} does not fit a signed amount")]
    ValueOutOfRange(u64),
    #[error("input {index} is not owned by its spending key")]
    WrongKey { index: usize },
    #[error("input {index} authentication path does not lead to the anchor")]
    AnchorMismatch { index: usize },
}

/// Everything a JoinSplit proof is verified against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSplitPublicInputs {
    pub anchor: Sha256Hash,
    pub h_sig: Sha256Hash,
    pub nullifiers: [Sha256Hash; JS_INPUTS],
    pub commitments: [Sha256Hash; JS_OUTPUTS],
    pub ephemeral_key: Sha256Hash,
    pub random_seed: Sha256Hash,
    pub macs: [Sha256Hash; JS_INPUTS],
    pub vpub_old: i64,
    pub vpub_new: i64,
}

impl JoinSplitPublicInputs {
    /// Public inputs of `js`, with `h_sig` derived from the transaction's
    /// JoinSplit signing key.
    pub fn from_description(js: &JoinSplitDescription, pub_key: &[u8; 32]) -> Self {
        JoinSplitPublicInputs {
            anchor: js.anchor,
            h_sig: h_sig(&js.random_seed, &js.nullifiers, pub_key),
            nullifiers: js.nullifiers,
            commitments: js.commitments,
            ephemeral_key: js.ephemeral_key,
            random_seed: js.random_seed,
            macs: js.macs,
            vpub_old: js.vpub_old,
            vpub_new: js.vpub_new,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(13 * 32 + 16);
        encoder.write_bytes(&self.anchor);
        encoder.write_bytes(&self.h_sig);
        for nullifier in &self.nullifiers {
            encoder.write_bytes(nullifier);
        }
        for commitment in &self.commitments {
            encoder.write_bytes(commitment);
        }
        encoder.write_bytes(&self.ephemeral_key);
        encoder.write_bytes(&self.random_seed);
        for mac in &self.macs {
            encoder.write_bytes(mac);
        }
        encoder.write_i64_le(self.vpub_old);
        encoder.write_i64_le(self.vpub_new);
        encoder.into_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct JsInput {
    pub path: AuthPath,
    pub note: Note,
    pub key: SpendingKey,
}

impl JsInput {
    pub fn new(path: AuthPath, note: Note, key: SpendingKey) -> Self {
        JsInput { path, note, key }
    }

    /// Zero-value input under a fresh key. Its path is never checked.
    pub fn dummy() -> Self {
        let key = SpendingKey::random();
        let note = Note::dummy(&key);
        JsInput {
            path: AuthPath::empty(),
            note,
            key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsOutput {
    pub a_pk: Sha256Hash,
    pub value: u64,
}

impl JsOutput {
    pub fn new(a_pk: Sha256Hash, value: u64) -> Self {
        JsOutput { a_pk, value }
    }

    pub fn dummy() -> Self {
        JsOutput {
            a_pk: SpendingKey::random().paying_key(),
            value: 0,
        }
    }
}

/// Private inputs of one JoinSplit.
#[derive(Debug, Clone)]
pub struct JoinSplitWitness {
    pub inputs: [JsInput; JS_INPUTS],
    pub outputs: [JsOutput; JS_OUTPUTS],
    pub pub_key: [u8; 32],
    pub anchor: Sha256Hash,
    pub vpub_old: u64,
    pub vpub_new: u64,
}

/// A proven descriptor together with the output notes it created, which the
/// caller needs to spend them later.
#[derive(Debug, Clone)]
pub struct ProvenJoinSplit {
    pub description: JoinSplitDescription,
    pub output_notes: [Note; JS_OUTPUTS],
}

pub trait ProofBackend: Send + Sync {
    fn prove_joinsplit(&self, witness: &JoinSplitWitness) -> Result<ProvenJoinSplit, ProofError>;

    /// Strict verification: any malformed proof is simply `false`.
    fn verify_joinsplit(&self, proof: &[u8], inputs: &JoinSplitPublicInputs) -> bool;
}

/// Deterministic backend whose "proof" is a keyed digest of the public inputs.
///
/// It enforces the statement when proving (balance, note ownership, anchor
/// membership) but carries no zero-knowledge or soundness guarantees; anyone
/// can forge a proof. Use it for regtest chains and tests only.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestProofBackend;

impl DigestProofBackend {
    pub fn new() -> Self {
        DigestProofBackend
    }

    fn digest(inputs: &JoinSplitPublicInputs) -> Vec<u8> {
        let encoded = inputs.encode();
        let mut proof = Vec::with_capacity(PROOF_SIZE + 64);
        let mut counter = 0u8;
        while proof.len() < PROOF_SIZE {
            let block = Params::new()
                .hash_length(64)
                .personal(b"SCJoinSplitProof")
                .to_state()
                .update(&[counter])
                .update(&encoded)
                .finalize();
            proof.extend_from_slice(block.as_bytes());
            counter += 1;
        }
        proof.truncate(PROOF_SIZE);
        proof
    }

    fn encrypt_note(note: &Note, ephemeral_key: &Sha256Hash, h_sig: &Sha256Hash, index: usize) -> Vec<u8> {
        let mut plaintext = Vec::with_capacity(NOTE_CIPHERTEXT_SIZE);
        plaintext.push(0x00);
        plaintext.extend_from_slice(&note.value.to_le_bytes());
        plaintext.extend_from_slice(&note.rho);
        plaintext.extend_from_slice(&note.r);
        plaintext.resize(NOTE_CIPHERTEXT_SIZE - 16, 0);

        let mut ciphertext = Vec::with_capacity(NOTE_CIPHERTEXT_SIZE);
        for (block_index, chunk) in plaintext.chunks(64).enumerate() {
            let keystream = Params::new()
                .hash_length(64)
                .personal(b"SCNoteEncryption")
                .to_state()
                .update(ephemeral_key)
                .update(h_sig)
                .update(&[index as u8])
                .update(&(block_index as u32).to_le_bytes())
                .finalize();
            ciphertext.extend(chunk.iter().zip(keystream.as_bytes()).map(|(p, k)| p ^ k));
        }

        let tag = Params::new().hash_length(16).hash(&ciphertext);
        ciphertext.extend_from_slice(tag.as_bytes());
        ciphertext
    }
}

impl ProofBackend for DigestProofBackend {
    fn prove_joinsplit(&self, witness: &JoinSplitWitness) -> Result<ProvenJoinSplit, ProofError> {
        let mut lhs = witness.vpub_old;
        for input in &witness.inputs {
            lhs = lhs.checked_add(input.note.value).ok_or(ProofError::ValueOverflow)?;
        }
        let mut rhs = witness.vpub_new;
        for output in &witness.outputs {
            rhs = rhs.checked_add(output.value).ok_or(ProofError::ValueOverflow)?;
        }
        if lhs != rhs {
            return Err(ProofError::Unbalanced { inputs: lhs, outputs: rhs });
        }

        for (index, input) in witness.inputs.iter().enumerate() {
            if input.key.paying_key() != input.note.a_pk {
                return Err(ProofError::WrongKey { index });
            }
            // Zero-value notes need not exist in the tree.
            if input.note.value != 0 && input.path.root(&input.note.commitment()) != witness.anchor {
                return Err(ProofError::AnchorMismatch { index });
            }
        }

        let vpub_old = i64::try_from(witness.vpub_old)
            .map_err(|_| ProofError::ValueOutOfRange(witness.vpub_old))?;
        let vpub_new = i64::try_from(witness.vpub_new)
            .map_err(|_| ProofError::ValueOutOfRange(witness.vpub_new))?;

        let nullifiers = [
            witness.inputs[0].note.nullifier(&witness.inputs[0].key),
            witness.inputs[1].note.nullifier(&witness.inputs[1].key),
        ];
        let random_seed = random_bytes32();
        let h_sig = h_sig(&random_seed, &nullifiers, &witness.pub_key);
        let macs = [
            witness.inputs[0].key.mac(0, &h_sig),
            witness.inputs[1].key.mac(1, &h_sig),
        ];

        let phi = random_bytes32();
        let output_notes = [
            Note::new(witness.outputs[0].a_pk, witness.outputs[0].value, derive_rho(&phi, 0, &h_sig)),
            Note::new(witness.outputs[1].a_pk, witness.outputs[1].value, derive_rho(&phi, 1, &h_sig)),
        ];
        let commitments = [output_notes[0].commitment(), output_notes[1].commitment()];

        let ephemeral_key = random_bytes32();
        let ciphertexts = [
            Self::encrypt_note(&output_notes[0], &ephemeral_key, &h_sig, 0),
            Self::encrypt_note(&output_notes[1], &ephemeral_key, &h_sig, 1),
        ];

        let public_inputs = JoinSplitPublicInputs {
            anchor: witness.anchor,
            h_sig,
            nullifiers,
            commitments,
            ephemeral_key,
            random_seed,
            macs,
            vpub_old,
            vpub_new,
        };
        let proof = Self::digest(&public_inputs);

        Ok(ProvenJoinSplit {
            description: JoinSplitDescription {
                vpub_old,
                vpub_new,
                anchor: witness.anchor,
                nullifiers,
                commitments,
                ephemeral_key,
                random_seed,
                macs,
                proof,
                ciphertexts,
            },
            output_notes,
        })
    }

    fn verify_joinsplit(&self, proof: &[u8], inputs: &JoinSplitPublicInputs) -> bool {
        proof.len() == PROOF_SIZE && proof == Self::digest(inputs).as_slice()
    }
}

//! Notes, spending keys and the pseudo-random functions binding them.

use crate::blockchain::Sha256Hash;
use blake2b_simd::Params;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const PRF_ADDR: u8 = 0x00;
const PRF_NF: u8 = 0x01;
const PRF_PK: u8 = 0x02;
const PRF_RHO: u8 = 0x03;

const NOTE_COMMITMENT_PREFIX: u8 = 0xb0;

fn prf(tag: u8, key: &[u8; 32], input: &[u8; 32]) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(key);
    hasher.update(input);
    hasher.finalize().into()
}

fn prf_indexed(tag: u8, key: &[u8; 32], index: usize, h_sig: &Sha256Hash) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update([tag, index as u8]);
    hasher.update(key);
    hasher.update(h_sig);
    hasher.finalize().into()
}

pub fn random_bytes32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Shielded spending key `a_sk`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingKey(pub [u8; 32]);

impl std::fmt::Debug for SpendingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SpendingKey(..)")
    }
}

impl SpendingKey {
    pub fn random() -> Self {
        SpendingKey(random_bytes32())
    }

    /// Paying key `a_pk = PRF_addr(a_sk, 0)`.
    pub fn paying_key(&self) -> Sha256Hash {
        prf(PRF_ADDR, &self.0, &[0u8; 32])
    }

    /// MAC binding input `index` of a JoinSplit to `h_sig`.
    pub fn mac(&self, index: usize, h_sig: &Sha256Hash) -> Sha256Hash {
        prf_indexed(PRF_PK, &self.0, index, h_sig)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub a_pk: Sha256Hash,
    pub value: u64,
    pub rho: Sha256Hash,
    pub r: Sha256Hash,
}

impl Note {
    pub fn new(a_pk: Sha256Hash, value: u64, rho: Sha256Hash) -> Self {
        Note {
            a_pk,
            value,
            rho,
            r: random_bytes32(),
        }
    }

    /// Zero-valued note owned by `key`, used to pad unused JoinSplit inputs.
    pub fn dummy(key: &SpendingKey) -> Self {
        Self::new(key.paying_key(), 0, random_bytes32())
    }

    pub fn commitment(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update([NOTE_COMMITMENT_PREFIX]);
        hasher.update(self.a_pk);
        hasher.update(self.value.to_le_bytes());
        hasher.update(self.rho);
        hasher.update(self.r);
        hasher.finalize().into()
    }

    pub fn nullifier(&self, key: &SpendingKey) -> Sha256Hash {
        prf(PRF_NF, &key.0, &self.rho)
    }
}

/// `rho` of output `index`, derived from the JoinSplit's `phi` and `h_sig`.
pub fn derive_rho(phi: &[u8; 32], index: usize, h_sig: &Sha256Hash) -> Sha256Hash {
    prf_indexed(PRF_RHO, phi, index, h_sig)
}

/// `h_sig` ties the descriptor to the transaction's signing key.
pub fn h_sig(
    random_seed: &Sha256Hash,
    nullifiers: &[Sha256Hash; 2],
    pub_key: &[u8; 32],
) -> Sha256Hash {
    let mut state = Params::new()
        .hash_length(32)
        .personal(b"ZcashComputehSig")
        .to_state();
    state.update(random_seed);
    for nullifier in nullifiers {
        state.update(nullifier);
    }
    state.update(pub_key);

    let mut out = [0u8; 32];
    out.copy_from_slice(state.finalize().as_bytes());
    out
}

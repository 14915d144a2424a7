//! Cryptographic primitives for ShieldChain

use crate::error::ChainError;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// One-time Ed25519 key pair signing a transaction's JoinSplits.
#[derive(Debug, Clone)]
pub struct JoinSplitKeyPair {
    signing_key: SigningKey,
}

impl JoinSplitKeyPair {
    /// Generates a fresh key pair from the OS random number generator.
    pub fn generate() -> Self {
        JoinSplitKeyPair {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| {
            ChainError::CryptoError(format!("Secret key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(JoinSplitKeyPair {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Strict Ed25519 verification: rejects small-order keys and non-canonical
/// signatures in addition to plain mismatches.
pub fn verify_joinsplit_signature(
    public_key: &[u8; PUBLIC_KEY_SIZE],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<(), ChainError> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;
    let signature = Signature::from_bytes(signature);
    verifying_key
        .verify_strict(message, &signature)
        .map_err(|e| ChainError::CryptoError(format!("Signature verification failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = JoinSplitKeyPair::generate();
        let message = [42u8; 32];
        let signature = keypair.sign(&message);
        assert!(verify_joinsplit_signature(&keypair.public_key_bytes(), &message, &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let keypair = JoinSplitKeyPair::generate();
        let signature = keypair.sign(&[1u8; 32]);
        assert!(verify_joinsplit_signature(&keypair.public_key_bytes(), &[2u8; 32], &signature).is_err());
    }

    #[test]
    fn test_from_secret_bytes_is_deterministic() {
        let a = JoinSplitKeyPair::from_secret_bytes(&[7u8; 32]).unwrap();
        let b = JoinSplitKeyPair::from_secret_bytes(&[7u8; 32]).unwrap();
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert!(JoinSplitKeyPair::from_secret_bytes(&[7u8; 31]).is_err());
    }
}

//! Signing capability for rich metadata.
//!
//! The core never generates or stores keys on its own; it signs through a
//! [`Signer`] and verifies through a [`SignatureVerifier`]. The Ed25519
//! implementations here use the 32-byte public key as the permid.

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use rand::RngCore;

use crate::torrent::Permid;

/// Signs payloads on behalf of the local publisher.
pub trait Signer: Send + Sync {
    /// Permid signatures verify against.
    fn permid(&self) -> Permid;

    fn sign(&self, payload: &[u8]) -> Vec<u8>;
}

/// Checks signatures against a publisher permid.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, permid: &Permid, payload: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 keypair acting as the local identity.
pub struct Ed25519Signer {
    key: SigningKey,
    permid: Permid,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let key = SigningKey::from_bytes(&seed);
        let permid = Permid::from_public_key(key.verifying_key().as_bytes());
        Self { key, permid }
    }

    /// Creates a signer with a fresh random key.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn seed(&self) -> [u8; 32] {
        self.key.to_bytes()
    }
}

impl Signer for Ed25519Signer {
    fn permid(&self) -> Permid {
        self.permid.clone()
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.key.sign(payload).to_bytes().to_vec()
    }
}

/// Verifies Ed25519 signatures where the permid is the public key.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, permid: &Permid, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(permid.as_bytes()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_strict(payload, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = Ed25519Signer::generate();
        let signature = signer.sign(b"payload");

        assert_eq!(signature.len(), 64);
        assert!(Ed25519Verifier.verify(&signer.permid(), b"payload", &signature));
        assert!(!Ed25519Verifier.verify(&signer.permid(), b"tampered", &signature));
    }

    #[test]
    fn test_foreign_key_and_garbage_fail() {
        let signer = Ed25519Signer::from_seed([1; 32]);
        let other = Ed25519Signer::from_seed([2; 32]);
        let signature = signer.sign(b"payload");

        assert!(!Ed25519Verifier.verify(&other.permid(), b"payload", &signature));
        assert!(!Ed25519Verifier.verify(&signer.permid(), b"payload", b"short"));
        let odd = Permid::from_slice(&[9; 20]).unwrap();
        assert!(!Ed25519Verifier.verify(&odd, b"payload", &signature));
    }

    #[test]
    fn test_seed_is_stable() {
        let signer = Ed25519Signer::from_seed([7; 32]);
        assert_eq!(signer.seed(), [7; 32]);
        assert_eq!(
            Ed25519Signer::from_seed(signer.seed()).permid(),
            signer.permid()
        );
    }
}

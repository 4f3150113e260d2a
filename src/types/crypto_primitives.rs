/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.

use super::basic::{PublicKeyBytes, SignatureBytes};

// re-exports below.
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// A wrapper around [SigningKey](ed25519_dalek::SigningKey) that implements a
/// [convenience method](Self::sign) for creating signatures as well as a [getter](Self::public) for the
/// public key.
#[derive(Clone)]
pub struct Keypair(pub(crate) SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Convenience method for creating signatures over values or messages represented as byte slices.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    pub fn public_bytes(&self) -> PublicKeyBytes {
        PublicKeyBytes::new(self.0.verifying_key().to_bytes())
    }
}

/// Verify a single `signature` over `message` by the key behind `public`. Malformed key or
/// signature bytes verify as false.
pub fn verify_single(public: &PublicKeyBytes, message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public.bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

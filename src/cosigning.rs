/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The collective signature produced by a forward-link signing round.
//!
//! A [CollectiveSignature] holds one optional signature slot per member of the roster of
//! the block that *owns* the forward link (the source block, not the destination). It is
//! correct when every present signature verifies over the signed message and the number of
//! present signatures reaches the quorum of the roster.
//!
//! The signing round itself lives in [crate::service]; this module only defines the
//! evidence it produces and the quorum rule.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{SignatureSet, SkipBlockID};
use crate::types::crypto_primitives::{verify_single, Keypair};
use crate::types::roster::Roster;

/// Minimal number of signers for a roster of `n` members to make a collective signature
/// byzantine-fault tolerant: strictly more than two thirds.
pub fn quorum(n: usize) -> usize {
    (n * 2) / 3 + 1
}

/// Proof that a quorum of a block's roster co-signed a forward link to `msg`.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct CollectiveSignature {
    signatures: SignatureSet,
}

impl CollectiveSignature {
    pub fn new(signatures: SignatureSet) -> Self {
        Self { signatures }
    }

    /// Synthesize the signature of a one-member roster: the single member signs alone and
    /// trivially forms a quorum.
    pub fn single(keypair: &Keypair, msg: &SkipBlockID) -> Self {
        let mut signatures = SignatureSet::new(1);
        signatures.set(0, Some(keypair.sign(&msg.bytes())));
        Self { signatures }
    }

    pub fn signatures(&self) -> &SignatureSet {
        &self.signatures
    }

    /// Checks that the signature set matches the roster in size, that every present
    /// signature is a valid signature over `msg` by the member at its position, and that
    /// the present signatures form a quorum.
    pub fn is_correct(&self, roster: &Roster, msg: &SkipBlockID) -> bool {
        if self.signatures.len() != roster.len() {
            return false;
        }

        let mut signers = 0;
        for (signature, member) in self.signatures.iter().zip(roster.iter()) {
            if let Some(signature) = signature {
                if !verify_single(&member.public, &msg.bytes(), &signature.bytes()) {
                    // contains an incorrect signature.
                    return false;
                }
                signers += 1;
            }
        }

        signers >= quorum(roster.len())
    }
}

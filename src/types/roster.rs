/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Server identities and the per-block roster.
//!
//! A [Roster] is the ordered list of conodes responsible for one skipblock. Element 0 is
//! the leader: the only member allowed to append the next block, and the root of every
//! co-signing round run over that block.

use borsh::{BorshDeserialize, BorshSerialize};
use rand::Rng;

use super::basic::{Address, PublicKeyBytes};
use super::crypto_primitives::VerifyingKey;

/// One conode: an Ed25519 identity plus the address it can be reached at.
#[derive(Clone, PartialEq, Eq, Hash, Debug, BorshDeserialize, BorshSerialize)]
pub struct ServerIdentity {
    pub public: PublicKeyBytes,
    pub address: Address,
}

impl ServerIdentity {
    pub fn new(public: PublicKeyBytes, address: Address) -> Self {
        Self { public, address }
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, ed25519_dalek::SignatureError> {
        VerifyingKey::from_bytes(&self.public.bytes())
    }
}

/// Ordered list of server identities; element 0 is the leader.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct Roster(Vec<ServerIdentity>);

impl Roster {
    pub fn new(members: Vec<ServerIdentity>) -> Self {
        Self(members)
    }

    pub fn leader(&self) -> Option<&ServerIdentity> {
        self.0.first()
    }

    pub fn get(&self, pos: usize) -> Option<&ServerIdentity> {
        self.0.get(pos)
    }

    /// Position of the member with the given public key.
    pub fn search(&self, public: &PublicKeyBytes) -> Option<usize> {
        self.0.iter().position(|si| si.public == *public)
    }

    pub fn contains(&self, public: &PublicKeyBytes) -> bool {
        self.search(public).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ServerIdentity> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A uniformly chosen member, used to spread block-fetch load.
    pub fn random_member(&self) -> Option<&ServerIdentity> {
        if self.0.is_empty() {
            return None;
        }
        let pos = rand::thread_rng().gen_range(0..self.0.len());
        self.0.get(pos)
    }

    /// Like [Self::random_member], but never the caller itself. Falls back to any member
    /// when the roster contains only the caller.
    pub fn random_other_member(&self, own: &PublicKeyBytes) -> Option<&ServerIdentity> {
        let others: Vec<&ServerIdentity> = self.0.iter().filter(|si| si.public != *own).collect();
        if others.is_empty() {
            return self.random_member();
        }
        let pos = rand::thread_rng().gen_range(0..others.len());
        others.get(pos).copied()
    }

    /// True if any member of `self` is also a member of `other`.
    pub fn overlaps(&self, other: &Roster) -> bool {
        self.0.iter().any(|si| other.contains(&si.public))
    }
}

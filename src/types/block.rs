/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the skipblock type and its methods.
//!
//! A skipblock has two parts. The *immutable* part is covered by the content hash that
//! identifies the block; it is fixed at creation. The *mutable* part — the hash itself,
//! the forward links and the anchored child chains — grows monotonically over the block's
//! lifetime and is never hashed.

use std::collections::HashSet;

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;

use crate::cosigning::CollectiveSignature;
use crate::errors::ServiceError;
use crate::store::SkipBlockMap;
use crate::types::basic::{SkipBlockID, VerifierID};
use crate::types::crypto_primitives::CryptoHasher;
use crate::types::payload::Payload;
use crate::types::roster::Roster;

/// Co-signed pointer from an earlier block to a later one. Entry `h` of a block's forward
/// links targets the next block of height at least `h + 1`, and is signed by the roster of
/// the block that owns the link.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct ForwardLink {
    pub to: SkipBlockID,
    pub signature: CollectiveSignature,
}

impl ForwardLink {
    /// Checks the collective signature against the roster of the link's source block.
    pub fn verify(&self, roster: &Roster) -> Result<(), ServiceError> {
        if self.signature.is_correct(roster, &self.to) {
            Ok(())
        } else {
            Err(ServiceError::Verification(format!(
                "bad collective signature on forward link to {}",
                self.to.short()
            )))
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct SkipBlock {
    // Immutable part, covered by the hash.
    pub index: u32,
    pub height: u32,
    pub maximum_height: u32,
    pub base_height: u32,
    pub verifier_ids: Vec<VerifierID>,
    pub parent_block_id: Option<SkipBlockID>,
    pub genesis_id: Option<SkipBlockID>,
    pub payload: Payload,
    pub roster: Roster,
    pub back_link_ids: Vec<SkipBlockID>,

    // Mutable part.
    pub hash: SkipBlockID,
    pub forward_links: Vec<ForwardLink>,
    pub child_chains: Vec<SkipBlockID>,
}

impl SkipBlock {
    /// A genesis proposal carrying the chain-wide parameters. Index, height, back links
    /// and hash are finalized by the service when the block is stored.
    pub fn genesis(
        roster: Roster,
        base_height: u32,
        maximum_height: u32,
        verifier_ids: Vec<VerifierID>,
        payload: Payload,
        parent_block_id: Option<SkipBlockID>,
    ) -> SkipBlock {
        SkipBlock {
            index: 0,
            height: maximum_height,
            maximum_height,
            base_height,
            verifier_ids,
            parent_block_id,
            genesis_id: None,
            payload,
            roster,
            back_link_ids: Vec::new(),
            hash: SkipBlockID::new([0u8; 32]),
            forward_links: Vec::new(),
            child_chains: Vec::new(),
        }
    }

    /// A proposal for the next block of an existing chain. Everything except roster and
    /// payload is inherited or computed by the service during the append.
    pub fn proposal(roster: Roster, payload: Payload) -> SkipBlock {
        SkipBlock {
            index: 0,
            height: 0,
            maximum_height: 0,
            base_height: 0,
            verifier_ids: Vec::new(),
            parent_block_id: None,
            genesis_id: None,
            payload,
            roster,
            back_link_ids: Vec::new(),
            hash: SkipBlockID::new([0u8; 32]),
            forward_links: Vec::new(),
            child_chains: Vec::new(),
        }
    }

    /// The canonical hash: Sha256 over the borsh bytes of every immutable field, in
    /// declaration order. Changing any immutable field changes the result.
    pub fn calculate_hash(&self) -> SkipBlockID {
        let mut hasher = CryptoHasher::new();
        hasher.update(&self.index.try_to_vec().unwrap());
        hasher.update(&self.height.try_to_vec().unwrap());
        hasher.update(&self.maximum_height.try_to_vec().unwrap());
        hasher.update(&self.base_height.try_to_vec().unwrap());
        hasher.update(&self.verifier_ids.try_to_vec().unwrap());
        hasher.update(&self.parent_block_id.try_to_vec().unwrap());
        hasher.update(&self.genesis_id.try_to_vec().unwrap());
        hasher.update(&self.payload.try_to_vec().unwrap());
        hasher.update(&self.roster.try_to_vec().unwrap());
        hasher.update(&self.back_link_ids.try_to_vec().unwrap());
        SkipBlockID::new(hasher.finalize().into())
    }

    pub fn update_hash(&mut self) {
        self.hash = self.calculate_hash();
    }

    /// The id of the chain this block belongs to: the genesis hash, or the block's own
    /// hash if it is the genesis itself.
    pub fn skip_chain_id(&self) -> SkipBlockID {
        self.genesis_id.unwrap_or(self.hash)
    }

    pub fn is_genesis(&self) -> bool {
        self.genesis_id.is_none()
    }

    pub fn forward_len(&self) -> usize {
        self.forward_links.len()
    }

    pub fn get_forward(&self, height: usize) -> Option<&ForwardLink> {
        self.forward_links.get(height)
    }

    /// Basic bounds every block must satisfy, genesis included.
    pub fn check_structure(&self) -> Result<(), ServiceError> {
        if self.maximum_height < 1 {
            return Err(ServiceError::ParameterWrong(
                "maximum height must be at least 1".to_string(),
            ));
        }
        if self.base_height < 1 {
            return Err(ServiceError::ParameterWrong(
                "base height must be at least 1".to_string(),
            ));
        }
        if self.maximum_height > self.base_height {
            return Err(ServiceError::ParameterWrong(
                "maximum height must be smaller or equal base height".to_string(),
            ));
        }
        if self.height < 1 || self.height > self.maximum_height {
            return Err(ServiceError::ParameterWrong(format!(
                "height {} outside 1..={}",
                self.height, self.maximum_height
            )));
        }
        if self.back_link_ids.is_empty() {
            return Err(ServiceError::ParameterWrong(
                "need at least one back link".to_string(),
            ));
        }
        if !self.is_genesis() && self.back_link_ids.len() != self.height as usize {
            return Err(ServiceError::ParameterWrong(format!(
                "{} back links for height {}",
                self.back_link_ids.len(),
                self.height
            )));
        }
        if self.roster.is_empty() {
            return Err(ServiceError::ParameterWrong("need a roster".to_string()));
        }
        Ok(())
    }

    /// Checks every forward link against this block's own roster.
    pub fn verify_forward_signatures(&self) -> Result<(), ServiceError> {
        for link in &self.forward_links {
            link.verify(&self.roster)?;
        }
        Ok(())
    }

    /// Like [Self::verify_forward_signatures], but also recurses into the genesis blocks
    /// of the child chains anchored at this block, resolving each child through `store`.
    /// A child genesis that is not held, or whose own forward signatures (and children)
    /// do not verify, fails the block.
    pub fn verify_forward_signatures_recursive(
        &self,
        store: &SkipBlockMap,
    ) -> Result<(), ServiceError> {
        let mut seen = HashSet::new();
        self.verify_forward_signatures_inner(store, &mut seen)
    }

    fn verify_forward_signatures_inner(
        &self,
        store: &SkipBlockMap,
        seen: &mut HashSet<SkipBlockID>,
    ) -> Result<(), ServiceError> {
        self.verify_forward_signatures()?;
        for child in &self.child_chains {
            if !seen.insert(*child) {
                continue;
            }
            let child_block = store.get_by_id(child).ok_or_else(|| {
                ServiceError::Verification(format!(
                    "child genesis {} of block {} is not held",
                    child.short(),
                    self.hash.short()
                ))
            })?;
            child_block.verify_forward_signatures_inner(store, seen)?;
        }
        Ok(())
    }
}

/// The height of the block at `index`: the largest `h <= maximum_height` such that
/// `base_height^(h-1)` divides `index`.
pub fn expected_height(index: u32, base_height: u32, maximum_height: u32) -> u32 {
    let mut height = 1;
    let mut index = index;
    while index % base_height == 0 {
        index /= base_height;
        if height >= maximum_height {
            break;
        }
        height += 1;
    }
    height
}

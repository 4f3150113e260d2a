/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Domain verification functions.
//!
//! Every chain names, in its genesis block, the ordered set of verifier ids that each
//! appended block must pass before the roster co-signs its forward link. The service holds
//! a registry mapping ids to verification functions; the built-in verifiers below mirror
//! the standard chain kinds (plain, root, control, data) of hierarchical chain setups.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::basic::{SkipBlockID, VerifierID};
use crate::types::block::SkipBlock;

/// A verification function: given the to-be-signed message (the block hash) and the block,
/// decide whether this conode endorses it.
pub type SkipBlockVerifier = Arc<dyn Fn(&SkipBlockID, &SkipBlock) -> bool + Send + Sync>;

/// Structural checks only.
pub const VERIFY_BASE: VerifierID = VerifierID::new(*b"skipchain:base\0\0");
/// For roots of hierarchical chains: must not itself have a parent.
pub const VERIFY_ROOT: VerifierID = VerifierID::new(*b"skipchain:root\0\0");
/// For control chains: the genesis must be anchored at a parent chain.
pub const VERIFY_CONTROL: VerifierID = VerifierID::new(*b"skipchain:ctrl\0\0");
/// For data chains: the genesis must be anchored at a parent chain.
pub const VERIFY_DATA: VerifierID = VerifierID::new(*b"skipchain:data\0\0");

/// No verification at all.
pub const VERIFICATION_NONE: &[VerifierID] = &[];
/// The standard verification for plain chains.
pub const VERIFICATION_STANDARD: &[VerifierID] = &[VERIFY_BASE];
/// Verification for the root chain of a root/control/data setup.
pub const VERIFICATION_ROOT: &[VerifierID] = &[VERIFY_BASE, VERIFY_ROOT];
/// Verification for a control chain anchored at a root chain.
pub const VERIFICATION_CONTROL: &[VerifierID] = &[VERIFY_BASE, VERIFY_CONTROL];
/// Verification for a data chain anchored at a control chain.
pub const VERIFICATION_DATA: &[VerifierID] = &[VERIFY_BASE, VERIFY_DATA];

/// The registry of verification functions known to one service instance.
pub struct VerifierRegistry {
    verifiers: HashMap<VerifierID, SkipBlockVerifier>,
}

impl VerifierRegistry {
    /// An empty registry. The service installs the built-in verifiers on startup.
    pub fn new() -> Self {
        Self {
            verifiers: HashMap::new(),
        }
    }

    /// Register `verifier` under `id`. Re-registration replaces the previous function.
    pub fn register(&mut self, id: VerifierID, verifier: SkipBlockVerifier) {
        self.verifiers.insert(id, verifier);
    }

    pub fn get(&self, id: &VerifierID) -> Option<SkipBlockVerifier> {
        self.verifiers.get(id).cloned()
    }

    /// Run every verifier named by the block, in order. An id with no registered function
    /// fails the whole verification.
    pub fn verify_all(&self, msg: &SkipBlockID, block: &SkipBlock) -> bool {
        for id in &block.verifier_ids {
            match self.verifiers.get(id) {
                Some(verifier) => {
                    if !verifier(msg, block) {
                        log::debug!("verifier {:?} refused block {}", id, block.hash.short());
                        return false;
                    }
                }
                None => {
                    log::debug!("no verifier registered for {:?}", id);
                    return false;
                }
            }
        }
        true
    }

    /// Install the built-in verifiers.
    pub fn register_builtin(&mut self) {
        self.register(
            VERIFY_BASE,
            Arc::new(|msg, block| {
                block.check_structure().is_ok() && block.calculate_hash() == *msg
            }),
        );
        self.register(
            VERIFY_ROOT,
            Arc::new(|_, block| block.parent_block_id.is_none()),
        );
        self.register(
            VERIFY_CONTROL,
            Arc::new(|_, block| !block.is_genesis() || block.parent_block_id.is_some()),
        );
        self.register(
            VERIFY_DATA,
            Arc::new(|_, block| !block.is_genesis() || block.parent_block_id.is_some()),
        );
    }
}

impl Default for VerifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The access-control policy: which skipchains this conode endorses.
//!
//! A conode at authentication level 0 accepts everything that verifies. At level 1 it
//! accepts only chains it already stores or follows, and blocks whose roster overlaps the
//! roster of a followed chain. Level 2 (all members of every roster must come from
//! followed rosters) is reserved and treated as "reject unless stored or followed".
//!
//! The level is state of the service instance, never process-global; it is part of the
//! persisted [FollowState].

use crate::store::SkipBlockMap;
use crate::types::basic::{PublicKeyBytes, SkipBlockID};
use crate::types::block::SkipBlock;
use crate::types::crypto_primitives::verify_single;

/// Follow configuration and client links, persisted as part of the service snapshot.
#[derive(Clone)]
pub struct FollowState {
    /// Latest blocks of skipchains that are allowed to create new blocks through us.
    pub follow: Vec<SkipBlock>,
    /// Chain ids we follow without holding any of their blocks yet.
    pub follow_ids: Vec<SkipBlockID>,
    /// Public keys of clients that have successfully linked to this conode.
    pub clients: Vec<PublicKeyBytes>,
    /// Authentication level, 0..=2.
    pub auth_level: u8,
}

impl FollowState {
    pub fn new() -> Self {
        Self {
            follow: Vec::new(),
            follow_ids: Vec::new(),
            clients: Vec::new(),
            auth_level: 0,
        }
    }

    /// True if `public` is a member of the roster of any followed latest block.
    pub fn in_followed_roster(&self, public: &PublicKeyBytes) -> bool {
        self.follow.iter().any(|sb| sb.roster.contains(public))
    }

    /// Admin-call authentication: any linked client key may sign. A conode without any
    /// linked clients is unlocked and accepts every admin call.
    pub fn verify_client_sig(&self, msg: &[u8], sig: &[u8]) -> bool {
        if self.clients.is_empty() {
            return true;
        }
        self.clients
            .iter()
            .any(|client| verify_single(client, msg, sig))
    }

    /// Block-store authentication: the signature may come from this conode itself, from
    /// any member of a followed chain's roster, or from a linked client.
    pub fn authenticate(&self, own: &PublicKeyBytes, msg: &[u8], sig: &[u8]) -> bool {
        if verify_single(own, msg, sig) {
            return true;
        }
        for sb in &self.follow {
            for si in sb.roster.iter() {
                if verify_single(&si.public, msg, sig) {
                    return true;
                }
            }
        }
        self.clients
            .iter()
            .any(|client| verify_single(client, msg, sig))
    }
}

impl Default for FollowState {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides whether this conode endorses `block` under the current policy: whether the
/// block is "friendly".
pub fn block_is_friendly(
    state: &FollowState,
    store: &SkipBlockMap,
    own: &PublicKeyBytes,
    block: &SkipBlock,
) -> bool {
    if state.auth_level == 0 {
        return true;
    }
    // Chains already stored with us stay welcome.
    if store.contains(&block.skip_chain_id()) {
        return true;
    }
    if state.follow_ids.contains(&block.skip_chain_id()) {
        return true;
    }
    match state.auth_level {
        1 => {
            for (index, si) in block.roster.iter().enumerate() {
                if si.public != *own {
                    if state.in_followed_roster(&si.public) {
                        return true;
                    }
                } else if block.roster.len() == 1 || index == 0 {
                    // We alone, or we as the leader, vouch for the block.
                    return true;
                }
            }
            false
        }
        _ => {
            // Level 2 is reserved; without the full "all rosters followed" check it
            // degrades to the stored-or-followed clauses above.
            false
        }
    }
}

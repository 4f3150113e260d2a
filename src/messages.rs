/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages of the skipchain service.
//!
//! The request/reply structs at the top are the external interface: what clients send to a
//! conode and what they get back. The [Message] enum at the bottom is the internal
//! interface: everything conodes send each other — forward-link signing rounds,
//! roster-extension queries, block fetches and block propagation.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{Address, PublicKeyBytes, RequestId, SignatureBytes, SkipBlockID};
use crate::types::block::{ForwardLink, SkipBlock};

/* ↓↓↓ External calls ↓↓↓ */

/// Requests a new skipblock to be appended after the block with id `latest_id`, or a new
/// skipchain to be created from `new_block` when `latest_id` is `None`.
///
/// When the receiving conode requires authentication, `signature` must be a valid
/// signature over the hash of `new_block` as submitted, by the conode's own key, a key of
/// a followed chain's roster, or a linked client key. It is carried as an opaque
/// variable-length byte string and parsed at verification time.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct StoreSkipBlock {
    pub latest_id: Option<SkipBlockID>,
    pub new_block: SkipBlock,
    pub signature: Option<Vec<u8>>,
}

/// The stored skipblock, along with the previous block carrying its fresh forward link.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct StoreSkipBlockReply {
    pub previous: Option<SkipBlock>,
    pub latest: SkipBlock,
}

/// The client sends the hash of the latest block it knows of and gets back the blocks
/// leading from there to the actual latest block.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetUpdateChain {
    pub latest_id: SkipBlockID,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetUpdateChainReply {
    pub update: Vec<SkipBlock>,
}

/// Asks for a single block by id.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetSingleBlock {
    pub id: SkipBlockID,
}

/// Asks for the block at `index` of the chain starting at `genesis`.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetSingleBlockByIndex {
    pub genesis: SkipBlockID,
    pub index: u32,
}

/// Asks for one block per skipchain known to the conode.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetAllSkipchains {}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct GetAllSkipchainsReply {
    pub skipchains: Vec<SkipBlock>,
}

/// Asks the conode to register `public` as an administrative client. The signature must
/// be by the conode's own private key over the public key bytes, which proves the caller
/// holds the conode's key material.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct CreateLinkPrivate {
    pub public: PublicKeyBytes,
    pub signature: Vec<u8>,
}

/// Sets the authentication level of the conode. The signature is over the single level
/// byte.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct SettingAuthentication {
    pub authentication: u8,
    pub signature: Vec<u8>,
}

/// How [AddFollow] locates the chain to follow.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub enum FollowPolicy {
    /// Record only the chain id; the chain itself may be unknown.
    Chain,
    /// Search all conodes known from stored and followed rosters for the chain's latest
    /// block.
    Search,
    /// Ask only the conode at the given address for the chain's latest block.
    Lookup,
}

/// Adds a skipchain to the conode's follow configuration. The signature is over the chain
/// id, the policy byte and the conode address, in that order.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct AddFollow {
    pub skipchain_id: SkipBlockID,
    pub search_policy: FollowPolicy,
    pub conode: Address,
    pub signature: Vec<u8>,
}

/// Removes a skipchain from the follow configuration. The signature is over the chain id.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct DelFollow {
    pub skipchain_id: SkipBlockID,
    pub signature: Vec<u8>,
}

/// Lists the follow configuration.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ListFollow {}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ListFollowReply {
    pub follow: Vec<SkipBlock>,
    pub follow_ids: Vec<SkipBlockID>,
}

/// Empty reply for calls that only return errors.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct EmptyReply {}

/* ↓↓↓ Internal calls ↓↓↓ */

/// Carried in a follow-block signing round: the evidence that `newest` extends the chain,
/// asking the roster of the block at `newest.back_link_ids[target_height]` to sign a
/// higher-level forward link to `newest`.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ForwardSignature {
    /// Index into the back links of `newest`, naming the block to update.
    pub target_height: u32,
    /// The second-newest skipblock.
    pub previous: SkipBlockID,
    /// The newest skipblock, already signed by the roster of `previous`.
    pub newest: SkipBlock,
    /// The level-0 forward link from `previous` to `newest`.
    pub forward_link: ForwardLink,
}

/// Asks a roster member to co-sign the level-0 forward link from `src` to `new_block`.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct SignNewBlockRequest {
    pub request_id: RequestId,
    pub src: SkipBlockID,
    pub new_block: SkipBlock,
}

/// Asks a roster member to co-sign a higher-level forward link described by `forward`.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct SignFollowBlockRequest {
    pub request_id: RequestId,
    pub forward: ForwardSignature,
}

/// A member's answer in any signing or roster-extension round: a signature if it accepted,
/// nothing if it refused.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct SignReply {
    pub request_id: RequestId,
    pub signature: Option<SignatureBytes>,
}

/// Asks a conode whether it would accept being part of the roster of the chain starting at
/// `genesis`.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ExtendRosterRequest {
    pub request_id: RequestId,
    pub genesis: SkipBlockID,
}

/// Proof that the conode identified by `si` accepted to be included in a new roster: its
/// signature over the chain's genesis id.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct ExtendSignature {
    pub si: PublicKeyBytes,
    pub signature: SignatureBytes,
}

/// Asks for a block: the exact block with this id ([Message::GetBlock]), or the latest
/// block reachable from it over level-0 forward links ([Message::GetUpdate]).
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct BlockRequest {
    pub request_id: RequestId,
    pub id: SkipBlockID,
}

#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct BlockReply {
    pub request_id: RequestId,
    pub block: Option<SkipBlock>,
}

/// Sends newly signed or updated skipblocks to all members of their rosters.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub struct PropagateSkipBlocks {
    pub skip_blocks: Vec<SkipBlock>,
}

/// Everything one conode can send another.
#[derive(Clone, Debug, BorshDeserialize, BorshSerialize)]
pub enum Message {
    SignNewBlock(SignNewBlockRequest),
    SignNewBlockReply(SignReply),
    SignFollowBlock(SignFollowBlockRequest),
    SignFollowBlockReply(SignReply),
    ExtendRoster(ExtendRosterRequest),
    ExtendRosterReply(SignReply),
    GetUpdate(BlockRequest),
    GetBlock(BlockRequest),
    BlockReply(BlockReply),
    Propagate(PropagateSkipBlocks),
}

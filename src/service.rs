/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The skipchain service: one running conode.
//!
//! A [Service] owns the block store, the follow configuration and a handler thread that
//! polls the [Network] for messages from other conodes. Client-facing operations —
//! appending blocks, reading chains, administering the follow lists — run on the caller's
//! thread and may start bounded sub-protocol rounds against other conodes:
//!
//! 1. The forward-link co-signing rounds (the service's rendering of the BFT signing
//!    primitive): the leader ships the evidence to every member of the signing roster,
//!    each member checks it with the registered verification callback and returns a
//!    signature, and the round succeeds once the collected set reaches quorum.
//! 2. The roster-extension query: before signing a block whose roster adds new members,
//!    each candidate is asked whether it accepts the chain.
//! 3. The block fetch: a missing or possibly-stale block is pulled from a random member
//!    of a roster known to hold it.
//!
//! Replies to in-flight rounds are routed through waiters keyed by request id; all waits
//! are bounded by the deadlines in [Configuration].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rand::RngCore;

use crate::config::Configuration;
use crate::cosigning::{self, CollectiveSignature};
use crate::errors::ServiceError;
use crate::messages::*;
use crate::network::Network;
use crate::persistence::{Persister, SnapshotError, SnapshotStore, StorageRecord};
use crate::policy::{block_is_friendly, FollowState};
use crate::store::SkipBlockMap;
use crate::types::basic::{
    Address, PublicKeyBytes, RequestId, SignatureBytes, SignatureSet, SkipBlockID, VerifierID,
};
use crate::types::block::{expected_height, ForwardLink, SkipBlock};
use crate::types::crypto_primitives::{verify_single, Keypair};
use crate::types::payload::{PayloadRegistry, PayloadTypeID};
use crate::types::roster::{Roster, ServerIdentity};
use crate::verifiers::{SkipBlockVerifier, VerifierRegistry};

/// A running skipchain conode. All methods are callable concurrently.
pub struct Service<N: Network, S: SnapshotStore> {
    inner: Arc<ServiceInner<N, S>>,
    handler: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Sender<()>>,
}

pub(crate) struct ServiceInner<N: Network, S: SnapshotStore> {
    keypair: Keypair,
    identity: ServerIdentity,
    config: Configuration,
    network: Mutex<N>,
    store: SkipBlockMap,
    follow: Mutex<FollowState>,
    verifiers: Mutex<VerifierRegistry>,
    payload_types: Mutex<PayloadRegistry>,
    waiters: Mutex<HashMap<RequestId, Sender<RoundReply>>>,
    new_blocks: Mutex<HashSet<SkipBlockID>>,
    next_request: AtomicU64,
    persister: Persister<S>,
    propagations: AtomicUsize,
    pool: Mutex<threadpool::ThreadPool>,
}

/// What flows back to a waiting sub-protocol round.
enum RoundReply {
    Signature {
        from: PublicKeyBytes,
        signature: Option<SignatureBytes>,
    },
    Block(Option<SkipBlock>),
}

impl<N: Network, S: SnapshotStore> Service<N, S> {
    /// Load the snapshot (if any) from `snapshot_store`, start the handler thread, and
    /// return the running service. A present-but-undecodable snapshot fails the start.
    pub fn start(
        keypair: Keypair,
        address: Address,
        network: N,
        snapshot_store: S,
        config: Configuration,
    ) -> Result<Self, SnapshotError> {
        let identity = ServerIdentity::new(keypair.public_bytes(), address);
        let persister = Persister::new(snapshot_store, config.save_quiet_window);
        let (store, follow) = match persister.load()? {
            Some(record) => (
                SkipBlockMap::from_blocks(record.blocks),
                FollowState {
                    follow: record.follow,
                    follow_ids: record.follow_ids,
                    clients: record.clients,
                    auth_level: record.auth_level,
                },
            ),
            None => (SkipBlockMap::new(), FollowState::new()),
        };

        let mut verifiers = VerifierRegistry::new();
        verifiers.register_builtin();

        let pool = threadpool::ThreadPool::new(config.handler_threads);
        let inner = Arc::new(ServiceInner {
            keypair,
            identity,
            config,
            network: Mutex::new(network),
            store,
            follow: Mutex::new(follow),
            verifiers: Mutex::new(verifiers),
            payload_types: Mutex::new(PayloadRegistry::new()),
            waiters: Mutex::new(HashMap::new()),
            new_blocks: Mutex::new(HashSet::new()),
            next_request: AtomicU64::new(1),
            persister,
            propagations: AtomicUsize::new(0),
            pool: Mutex::new(pool),
        });

        let (shutdown, shutdown_receiver) = mpsc::channel();
        let handler_inner = Arc::clone(&inner);
        let handler = thread::spawn(move || message_loop(handler_inner, shutdown_receiver));

        Ok(Self {
            inner,
            handler: Mutex::new(Some(handler)),
            shutdown: Mutex::new(shutdown),
        })
    }

    /// Stop the handler thread. In-flight pool jobs are left to finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown.lock().unwrap().send(());
        if let Some(handler) = self.handler.lock().unwrap().take() {
            let _ = handler.join();
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.inner.identity
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        self.inner.identity.public
    }

    /// The local block store, mainly for inspection in tests and tooling.
    pub fn skipblock_store(&self) -> &SkipBlockMap {
        &self.inner.store
    }

    /// True while this conode is forming a block or applying a received propagation.
    pub fn is_propagating(&self) -> bool {
        !self.inner.new_blocks.lock().unwrap().is_empty()
            || self.inner.propagations.load(Ordering::SeqCst) > 0
    }

    /// Register a domain verification function under `id`.
    pub fn register_verifier(&self, id: VerifierID, verifier: SkipBlockVerifier) {
        self.inner.verifiers.lock().unwrap().register(id, verifier);
    }

    /// Register a payload type name. Returns false if the id is taken.
    pub fn register_payload_type(&self, type_id: PayloadTypeID, name: &'static str) -> bool {
        self.inner.payload_types.lock().unwrap().register(type_id, name)
    }

    /* ↓↓↓ External API ↓↓↓ */

    pub fn store_skip_block(
        &self,
        req: StoreSkipBlock,
    ) -> Result<StoreSkipBlockReply, ServiceError> {
        self.inner.store_skip_block(req)
    }

    pub fn get_update_chain(
        &self,
        req: GetUpdateChain,
    ) -> Result<GetUpdateChainReply, ServiceError> {
        self.inner.get_update_chain(req)
    }

    pub fn get_single_block(&self, req: GetSingleBlock) -> Result<SkipBlock, ServiceError> {
        self.inner
            .store
            .get_by_id(&req.id)
            .ok_or_else(|| ServiceError::BlockNotFound("no such block".to_string()))
    }

    pub fn get_single_block_by_index(
        &self,
        req: GetSingleBlockByIndex,
    ) -> Result<SkipBlock, ServiceError> {
        self.inner.get_single_block_by_index(req)
    }

    pub fn get_all_skipchains(
        &self,
        _req: GetAllSkipchains,
    ) -> Result<GetAllSkipchainsReply, ServiceError> {
        Ok(GetAllSkipchainsReply {
            skipchains: self.inner.store.latest_per_chain(),
        })
    }

    pub fn create_link_private(&self, req: CreateLinkPrivate) -> Result<EmptyReply, ServiceError> {
        self.inner.create_link_private(req)
    }

    pub fn setting_authentication(
        &self,
        req: SettingAuthentication,
    ) -> Result<EmptyReply, ServiceError> {
        self.inner.setting_authentication(req)
    }

    pub fn add_follow(&self, req: AddFollow) -> Result<EmptyReply, ServiceError> {
        self.inner.add_follow(req)
    }

    pub fn del_follow(&self, req: DelFollow) -> Result<EmptyReply, ServiceError> {
        self.inner.del_follow(req)
    }

    pub fn list_follow(&self, _req: ListFollow) -> Result<ListFollowReply, ServiceError> {
        let follow = self.inner.follow.lock().unwrap();
        Ok(ListFollowReply {
            follow: follow.follow.clone(),
            follow_ids: follow.follow_ids.clone(),
        })
    }
}

impl<N: Network, S: SnapshotStore> Drop for Service<N, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/* ↓↓↓ The append engine and read path ↓↓↓ */

impl<N: Network, S: SnapshotStore> ServiceInner<N, S> {
    /// Store a new skipblock: either the genesis of a new chain (`latest_id` is None) or
    /// the next block of an existing one. Only the leader of the new block's roster may
    /// call this, and only one append runs at a time.
    fn store_skip_block(&self, req: StoreSkipBlock) -> Result<StoreSkipBlockReply, ServiceError> {
        let mut prop = req.new_block;

        match prop.roster.leader() {
            Some(leader) if leader.public == self.identity.public => {}
            _ => {
                return Err(ServiceError::ParameterWrong(
                    "only the leader is allowed to add blocks".to_string(),
                ))
            }
        }

        let auth_level = self.follow.lock().unwrap().auth_level;
        if auth_level > 0 {
            let signature = req.signature.as_ref().ok_or_else(|| {
                ServiceError::ParameterWrong(
                    "cannot create new skipblock without authentication".to_string(),
                )
            })?;
            let submitted_hash = prop.calculate_hash();
            let follow = self.follow.lock().unwrap();
            if !follow.authenticate(&self.identity.public, &submitted_hash.bytes(), signature) {
                return Err(ServiceError::ParameterWrong(
                    "wrong signature for this skipchain".to_string(),
                ));
            }
        }

        match req.latest_id {
            None => self.store_genesis_block(prop, auth_level),
            Some(latest_id) => {
                log::debug!("adding block to {}", latest_id.short());
                self.append_block(latest_id, &mut prop)
            }
        }
    }

    fn store_genesis_block(
        &self,
        mut prop: SkipBlock,
        auth_level: u8,
    ) -> Result<StoreSkipBlockReply, ServiceError> {
        prop.index = 0;
        prop.height = prop.maximum_height;
        prop.forward_links.clear();
        // the genesis block has a random back link.
        let mut back_link = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut back_link);
        prop.back_link_ids = vec![SkipBlockID::new(back_link)];
        prop.genesis_id = None;
        prop.update_hash();
        prop.check_structure()?;

        if auth_level >= 1 {
            let follow = self.follow.lock().unwrap();
            if !block_is_friendly(&follow, &self.store, &self.identity.public, &prop) {
                return Err(ServiceError::BlockContent(
                    "this conode does not follow the new chain".to_string(),
                ));
            }
        }

        let _guard = self.start_append(prop.hash)?;

        // The child genesis goes first so receivers hold it before they verify the
        // parent, which recurses into its child chains.
        let mut changed = vec![prop.clone()];
        if let Some(parent_id) = prop.parent_block_id {
            let parent = self.store.add_child(&parent_id, prop.hash)?;
            changed.push(parent);
        }

        self.propagate(&changed);
        self.save();
        Ok(StoreSkipBlockReply {
            previous: None,
            latest: self.store.get_by_id(&prop.hash).unwrap_or(prop),
        })
    }

    fn append_block(
        &self,
        latest_id: SkipBlockID,
        prop: &mut SkipBlock,
    ) -> Result<StoreSkipBlockReply, ServiceError> {
        let prev = self.store.get_by_id(&latest_id).ok_or_else(|| {
            ServiceError::BlockNotFound("didn't find latest block".to_string())
        })?;
        if !prev.roster.contains(&self.identity.public) {
            return Err(ServiceError::BlockContent(
                "we're not responsible for the latest block".to_string(),
            ));
        }
        if prev.forward_len() > 0 {
            return Err(ServiceError::BlockContent(
                "the latest block already has a follower".to_string(),
            ));
        }
        let _guard = self.start_append(prev.hash)?;

        prop.maximum_height = prev.maximum_height;
        prop.base_height = prev.base_height;
        prop.parent_block_id = None;
        prop.verifier_ids = prev.verifier_ids.clone();
        prop.index = prev.index + 1;
        prop.genesis_id = Some(prev.skip_chain_id());
        prop.height = expected_height(prop.index, prop.base_height, prop.maximum_height);
        prop.forward_links.clear();
        prop.child_chains.clear();
        log::debug!(
            "found height {} for index {} with base {} and maximum {}",
            prop.height,
            prop.index,
            prop.base_height,
            prop.maximum_height
        );

        // Walk backward to find, for each height, the most recent block tall enough to
        // carry the matching forward link.
        prop.back_link_ids = Vec::with_capacity(prop.height as usize);
        let mut pointer = prev.clone();
        for height in 0..prop.height {
            while pointer.height < height + 1 {
                pointer = self
                    .store
                    .get_by_id(&pointer.back_link_ids[0])
                    .ok_or_else(|| {
                        ServiceError::BlockNotFound(format!(
                            "didn't find fitting skipblock for height {}",
                            height
                        ))
                    })?;
            }
            prop.back_link_ids.push(pointer.hash);
        }
        prop.update_hash();

        // Every conode new to the roster must confirm it accepts the chain; a single
        // refusal discards the whole extension.
        if prop.roster != prev.roster {
            let mut accepted: Vec<ExtendSignature> = Vec::new();
            for si in prop.roster.iter() {
                if prev.roster.contains(&si.public) {
                    continue;
                }
                match self.will_node_accept_genesis(si, prop.skip_chain_id()) {
                    Some(proof) => accepted.push(proof),
                    None => {
                        return Err(ServiceError::BlockContent(
                            "node refused to accept the new roster".to_string(),
                        ))
                    }
                }
            }
            if !accepted.is_empty() {
                log::debug!(
                    "{} new roster members accepted chain {}",
                    accepted.len(),
                    prop.skip_chain_id().short()
                );
            }
        }

        let prev_updated = self.add_forward_link(&prev, prop).map_err(|err| {
            ServiceError::BlockContent(format!(
                "couldn't get forward signature on block: {}",
                err
            ))
        })?;

        let mut changed = vec![prev_updated.clone(), prop.clone()];

        // Retroactively sign the higher forward links of the back-linked blocks. A
        // failure here leaves the append valid with only the level-0 forward link.
        if let Some(forward_link_0) = prev_updated.get_forward(0).cloned() {
            for (height, back_id) in prop.back_link_ids.iter().enumerate().skip(1) {
                if self.store.get_by_id(back_id).is_none() {
                    return Err(ServiceError::BlockContent(
                        "didn't get skipblock in back link".to_string(),
                    ));
                }
                match self.forward_signature(ForwardSignature {
                    target_height: height as u32,
                    previous: prev.hash,
                    newest: prop.clone(),
                    forward_link: forward_link_0.clone(),
                }) {
                    Ok(back_updated) => changed.push(back_updated),
                    Err(err) => log::error!("couldn't get old block to sign: {}", err),
                }
            }
        }

        self.propagate(&changed);
        self.save();
        Ok(StoreSkipBlockReply {
            previous: Some(self.store.get_by_id(&prev.hash).unwrap_or(prev_updated)),
            latest: self.store.get_by_id(&prop.hash).unwrap_or_else(|| prop.clone()),
        })
    }

    /// Run the new-block co-signing round over the roster of `src` and attach the
    /// resulting level-0 forward link to the stored copy of `src`.
    fn add_forward_link(
        &self,
        src: &SkipBlock,
        dst: &SkipBlock,
    ) -> Result<SkipBlock, ServiceError> {
        if src.forward_len() > 0 {
            return Err(ServiceError::BlockContent(
                "already have forward link at this height".to_string(),
            ));
        }
        log::debug!(
            "{} is adding forward link {}->{}",
            self.identity.address,
            src.index,
            dst.index
        );
        let signature = self.cosign(
            &src.roster,
            &dst.hash,
            |request_id| {
                Message::SignNewBlock(SignNewBlockRequest {
                    request_id,
                    src: src.hash,
                    new_block: dst.clone(),
                })
            },
            || self.bft_verify_new_block(&dst.hash, &src.hash, dst),
        )?;
        let link = ForwardLink {
            to: dst.hash,
            signature,
        };
        link.verify(&src.roster)?;
        // attach_forward fails here if the link got signed during our signing.
        self.store.attach_forward(&src.hash, 0, link)
    }

    /// Run the follow-block co-signing round over the roster of the targeted back-linked
    /// block and attach the higher-level forward link to it.
    fn forward_signature(&self, fs: ForwardSignature) -> Result<SkipBlock, ServiceError> {
        let target_height = fs.target_height as usize;
        if target_height >= fs.newest.back_link_ids.len() {
            return Err(ServiceError::ParameterWrong(
                "this backlink height doesn't exist".to_string(),
            ));
        }
        let target_id = fs.newest.back_link_ids[target_height];
        let target = self.store.get_by_id(&target_id).ok_or_else(|| {
            ServiceError::BlockNotFound("didn't find target block".to_string())
        })?;
        let newest_hash = fs.newest.hash;
        let signature = self.cosign(
            &target.roster,
            &newest_hash,
            |request_id| {
                Message::SignFollowBlock(SignFollowBlockRequest {
                    request_id,
                    forward: fs.clone(),
                })
            },
            || self.bft_verify_follow_block(&newest_hash, &fs),
        )?;
        log::info!("adding forward link to block at index {}", target.index);
        self.store.attach_forward(
            &target_id,
            target_height,
            ForwardLink {
                to: newest_hash,
                signature,
            },
        )
    }

    /// One co-signing round: collect signatures over `msg` from `roster` until quorum.
    /// `build` creates the request shipped to each member; `verify_local` is this node's
    /// own run of the verification callback. A one-member roster short-circuits into a
    /// synthesized single-signer signature.
    fn cosign(
        &self,
        roster: &Roster,
        msg: &SkipBlockID,
        build: impl Fn(RequestId) -> Message,
        verify_local: impl Fn() -> bool,
    ) -> Result<CollectiveSignature, ServiceError> {
        let my_pos = roster.search(&self.identity.public).ok_or_else(|| {
            ServiceError::ParameterWrong("we're not part of the signing roster".to_string())
        })?;
        if roster.len() == 1 {
            return Ok(CollectiveSignature::single(&self.keypair, msg));
        }
        if !verify_local() {
            return Err(ServiceError::Verification(
                "refusing to sign our own request".to_string(),
            ));
        }

        let mut signatures = SignatureSet::new(roster.len());
        signatures.set(my_pos, Some(self.keypair.sign(&msg.bytes())));
        let mut signers = 1;
        let mut refusals = 0;
        let needed = cosigning::quorum(roster.len());

        let request_id = self.next_request_id();
        let (receiver, _guard) = self.register_waiter(request_id);
        for si in roster.iter() {
            if si.public != self.identity.public {
                self.send_to(si, build(request_id))?;
            }
        }

        let deadline = Instant::now() + self.config.cosign_timeout;
        while signers < needed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ServiceError::Transport(
                    "timed out while waiting for signatures".to_string(),
                ));
            }
            match receiver.recv_timeout(remaining) {
                Ok(RoundReply::Signature { from, signature }) => {
                    let Some(pos) = roster.search(&from) else {
                        continue;
                    };
                    match signature {
                        Some(sig) if verify_single(&from, &msg.bytes(), &sig.bytes()) => {
                            if signatures.get(pos).is_none() {
                                signatures.set(pos, Some(sig));
                                signers += 1;
                            }
                        }
                        _ => {
                            refusals += 1;
                            if roster.len().saturating_sub(refusals) < needed {
                                return Err(ServiceError::Verification(
                                    "roster refused to co-sign".to_string(),
                                ));
                            }
                        }
                    }
                }
                Ok(RoundReply::Block(_)) => {}
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ServiceError::Transport(
                        "timed out while waiting for signatures".to_string(),
                    ))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ServiceError::Transport(
                        "signing round aborted".to_string(),
                    ))
                }
            }
        }
        Ok(CollectiveSignature::new(signatures))
    }

    /// The new-block verification callback: this node's precondition for co-signing a
    /// level-0 forward link.
    fn bft_verify_new_block(
        &self,
        msg: &SkipBlockID,
        src: &SkipBlockID,
        new_block: &SkipBlock,
    ) -> bool {
        let Some(src_block) = self.store.get_by_id(src) else {
            log::debug!("{}: didn't find src skipblock", self.identity.address);
            return false;
        };
        if new_block.hash != *msg || new_block.calculate_hash() != *msg {
            log::debug!("proposed skipblock differs from the signed message");
            return false;
        }
        if new_block.check_structure().is_err() {
            return false;
        }
        if new_block.back_link_ids.first() != Some(src) {
            log::debug!(
                "back link does not point to previous block: {} {}",
                src_block.index,
                new_block.index
            );
            return false;
        }
        if src_block.forward_len() > 0 {
            log::debug!("previous block already has a forward link");
            return false;
        }
        self.verifiers.lock().unwrap().verify_all(msg, new_block)
    }

    /// The follow-block verification callback: this node's precondition for co-signing a
    /// higher-level forward link.
    fn bft_verify_follow_block(&self, msg: &SkipBlockID, fs: &ForwardSignature) -> bool {
        let Some(previous) = self.store.get_by_id(&fs.previous) else {
            log::debug!("didn't find previous block");
            return false;
        };
        let newest = &fs.newest;
        let target_height = fs.target_height as usize;
        if target_height >= newest.back_link_ids.len() {
            log::debug!("asked to sign too high a back link");
            return false;
        }
        if fs.forward_link.verify(&previous.roster).is_err() {
            log::debug!("wrong forward-link signature");
            return false;
        }
        if fs.forward_link.to != newest.hash || newest.hash != *msg {
            log::debug!("no forward link from previous to newest");
            return false;
        }
        let Some(target) = self.store.get_by_id(&newest.back_link_ids[target_height]) else {
            log::debug!("don't have target block");
            return false;
        };
        if target.forward_len() >= target_height + 1 {
            log::debug!("already have forward link at height {}", target_height + 1);
            return false;
        }
        if target.skip_chain_id() != newest.skip_chain_id() {
            log::debug!("target and newest are not from the same skipchain");
            return false;
        }
        true
    }

    /// Ask `si` whether it accepts being part of the roster of the chain starting at
    /// `genesis`: the roster-extension query against one candidate. Acceptance is proven
    /// by the candidate's signature over the genesis id; a missing, refused or invalid
    /// reply counts as refusal.
    fn will_node_accept_genesis(
        &self,
        si: &ServerIdentity,
        genesis: SkipBlockID,
    ) -> Option<ExtendSignature> {
        if si.public == self.identity.public {
            return Some(ExtendSignature {
                si: self.identity.public,
                signature: self.keypair.sign(&genesis.bytes()),
            });
        }
        let request_id = self.next_request_id();
        let (receiver, _guard) = self.register_waiter(request_id);
        self.send_to(si, Message::ExtendRoster(ExtendRosterRequest { request_id, genesis }))
            .ok()?;
        let deadline = Instant::now() + self.config.extend_roster_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match receiver.recv_timeout(remaining) {
                Ok(RoundReply::Signature { from, signature }) if from == si.public => {
                    let signature = signature?;
                    if !verify_single(&si.public, &genesis.bytes(), &signature.bytes()) {
                        return None;
                    }
                    return Some(ExtendSignature {
                        si: si.public,
                        signature,
                    });
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Fetch the exact block `id` from a random member of `roster`. Used when walking a
    /// chain past blocks we do not hold, or hold in a possibly-stale version.
    fn call_get_block(
        &self,
        roster: &Roster,
        id: SkipBlockID,
    ) -> Result<SkipBlock, ServiceError> {
        let target = roster.random_other_member(&self.identity.public).ok_or_else(|| {
            ServiceError::Transport("no roster member to fetch from".to_string())
        })?;
        if target.public == self.identity.public {
            return self.store.get_by_id(&id).ok_or_else(|| {
                ServiceError::BlockNotFound(format!("no block {}", id.short()))
            });
        }
        let request_id = self.next_request_id();
        let (receiver, _guard) = self.register_waiter(request_id);
        self.send_to(target, Message::GetBlock(BlockRequest { request_id, id }))?;

        let deadline = Instant::now() + self.config.block_fetch_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ServiceError::BlockNotFound(format!(
                    "couldn't get updated block in time: {}",
                    id.short()
                )));
            }
            match receiver.recv_timeout(remaining) {
                Ok(RoundReply::Block(Some(block))) if block.hash == id => return Ok(block),
                Ok(RoundReply::Block(None)) => {
                    return Err(ServiceError::BlockNotFound(format!(
                        "couldn't get updated block: {}",
                        id.short()
                    )))
                }
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ServiceError::BlockNotFound(format!(
                        "couldn't get updated block in time: {}",
                        id.short()
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ServiceError::Transport("fetch aborted".to_string()))
                }
            }
        }
    }

    /// Ask `si` for the latest block reachable from `id`. `None` on refusal or timeout.
    fn fetch_update_from(&self, si: &ServerIdentity, id: SkipBlockID) -> Option<SkipBlock> {
        if si.public == self.identity.public {
            return self.store.get_latest(&id).ok();
        }
        let request_id = self.next_request_id();
        let (receiver, _guard) = self.register_waiter(request_id);
        self.send_to(si, Message::GetUpdate(BlockRequest { request_id, id }))
            .ok()?;
        let deadline = Instant::now() + self.config.block_fetch_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match receiver.recv_timeout(remaining) {
                Ok(RoundReply::Block(block)) => return block,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Multicast `blocks` to the union of their rosters and apply them locally. Delivery
    /// is best-effort; conodes that miss it catch up through the block fetch on their next
    /// read.
    fn propagate(&self, blocks: &[SkipBlock]) {
        log::debug!(
            "{} starting to propagate {} blocks",
            self.identity.address,
            blocks.len()
        );
        for block in blocks {
            self.store.store(block.clone());
        }
        let mut recipients: HashMap<PublicKeyBytes, ServerIdentity> = HashMap::new();
        for block in blocks {
            for si in block.roster.iter() {
                recipients.insert(si.public, si.clone());
            }
        }
        let message = Message::Propagate(PropagateSkipBlocks {
            skip_blocks: blocks.to_vec(),
        });
        for si in recipients.values() {
            if si.public != self.identity.public {
                if let Err(err) = self.send_to(si, message.clone()) {
                    log::warn!("couldn't propagate to {}: {}", si.address, err);
                }
            }
        }
    }

    fn get_update_chain(&self, req: GetUpdateChain) -> Result<GetUpdateChainReply, ServiceError> {
        let mut block = self.store.get_by_id(&req.latest_id).ok_or_else(|| {
            ServiceError::BlockNotFound("couldn't find latest skipblock".to_string())
        })?;
        log::debug!(
            "{} starting to search chain at {}",
            self.identity.address,
            block.hash.short()
        );
        let mut update = vec![block.clone()];
        while let Some(link) = block.forward_links.last().cloned() {
            let next = match self.store.get_by_id(&link.to) {
                None => {
                    log::debug!("didn't find next block, fetching {}", link.to.short());
                    self.call_get_block(&block.roster, link.to)?
                }
                Some(next) => {
                    if next.roster.contains(&self.identity.public) {
                        next
                    } else {
                        // We're not responsible for that block; its roster may hold a
                        // version with more forward links.
                        self.call_get_block(&next.roster, link.to)?
                    }
                }
            };
            update.push(next.clone());
            block = next;
        }
        log::debug!("found {} blocks", update.len());
        Ok(GetUpdateChainReply { update })
    }

    fn get_single_block_by_index(
        &self,
        req: GetSingleBlockByIndex,
    ) -> Result<SkipBlock, ServiceError> {
        let mut block = self.store.get_by_id(&req.genesis).ok_or_else(|| {
            ServiceError::BlockNotFound("no such genesis block".to_string())
        })?;
        if block.index == req.index {
            return Ok(block);
        }
        while let Some(link) = block.get_forward(0).cloned() {
            block = self.store.get_by_id(&link.to).ok_or_else(|| {
                ServiceError::BlockNotFound("no block with this index found".to_string())
            })?;
            if block.index == req.index {
                return Ok(block);
            }
        }
        Err(ServiceError::BlockNotFound(
            "no block with this index found".to_string(),
        ))
    }

    /* ↓↓↓ Admin & link ↓↓↓ */

    fn create_link_private(&self, req: CreateLinkPrivate) -> Result<EmptyReply, ServiceError> {
        if !verify_single(&self.identity.public, &req.public.bytes(), &req.signature) {
            return Err(ServiceError::ParameterWrong(
                "wrong signature on public key".to_string(),
            ));
        }
        self.follow.lock().unwrap().clients.push(req.public);
        self.save();
        Ok(EmptyReply {})
    }

    fn setting_authentication(
        &self,
        req: SettingAuthentication,
    ) -> Result<EmptyReply, ServiceError> {
        let msg = [req.authentication];
        if !self.follow.lock().unwrap().verify_client_sig(&msg, &req.signature) {
            return Err(ServiceError::ParameterWrong(
                "wrong signature or unknown signer".to_string(),
            ));
        }
        if req.authentication > 2 {
            return Err(ServiceError::ParameterWrong(
                "unknown authentication option".to_string(),
            ));
        }
        if req.authentication == 2 {
            return Err(ServiceError::ParameterWrong(
                "authentication level 2 is reserved".to_string(),
            ));
        }
        self.follow.lock().unwrap().auth_level = req.authentication;
        self.save();
        Ok(EmptyReply {})
    }

    fn add_follow(&self, req: AddFollow) -> Result<EmptyReply, ServiceError> {
        let mut msg = req.skipchain_id.bytes().to_vec();
        msg.push(match req.search_policy {
            FollowPolicy::Chain => 0,
            FollowPolicy::Search => 1,
            FollowPolicy::Lookup => 2,
        });
        msg.extend_from_slice(req.conode.str().as_bytes());
        if !self.follow.lock().unwrap().verify_client_sig(&msg, &req.signature) {
            return Err(ServiceError::ParameterWrong(
                "wrong signature or unknown signer".to_string(),
            ));
        }

        match req.search_policy {
            FollowPolicy::Chain => {
                self.follow.lock().unwrap().follow_ids.push(req.skipchain_id);
            }
            FollowPolicy::Search => {
                let identities = self.known_identities();
                let mut found = None;
                for si in identities.values() {
                    if let Some(latest) = self.fetch_update_from(si, req.skipchain_id) {
                        if latest.skip_chain_id() == req.skipchain_id {
                            found = Some(latest);
                            break;
                        }
                    }
                }
                let latest = found.ok_or_else(|| {
                    ServiceError::ParameterWrong("didn't find that skipchain id".to_string())
                })?;
                self.follow.lock().unwrap().follow.push(latest);
            }
            FollowPolicy::Lookup => {
                let si = self.identity_by_address(&req.conode).ok_or_else(|| {
                    ServiceError::BlockNotFound(
                        "didn't find a conode at the given address".to_string(),
                    )
                })?;
                let latest = self
                    .fetch_update_from(&si, req.skipchain_id)
                    .ok_or_else(|| {
                        ServiceError::BlockNotFound(
                            "didn't find skipchain at the given address".to_string(),
                        )
                    })?;
                if latest.skip_chain_id() != req.skipchain_id {
                    return Err(ServiceError::BlockNotFound(
                        "returned block is not correct".to_string(),
                    ));
                }
                self.follow.lock().unwrap().follow.push(latest);
            }
        }
        self.save();
        Ok(EmptyReply {})
    }

    fn del_follow(&self, req: DelFollow) -> Result<EmptyReply, ServiceError> {
        if !self
            .follow
            .lock()
            .unwrap()
            .verify_client_sig(&req.skipchain_id.bytes(), &req.signature)
        {
            return Err(ServiceError::ParameterWrong(
                "wrong signature or unknown signer".to_string(),
            ));
        }
        let removed = {
            let mut follow = self.follow.lock().unwrap();
            let before = follow.follow_ids.len() + follow.follow.len();
            follow.follow_ids.retain(|id| *id != req.skipchain_id);
            follow
                .follow
                .retain(|sb| sb.skip_chain_id() != req.skipchain_id);
            before != follow.follow_ids.len() + follow.follow.len()
        };
        if !removed {
            return Err(ServiceError::BlockNotFound(
                "not following that skipchain".to_string(),
            ));
        }
        self.save();
        Ok(EmptyReply {})
    }

    /* ↓↓↓ Message handlers ↓↓↓ */

    fn handle_sign_new_block(&self, origin: &PublicKeyBytes, req: SignNewBlockRequest) {
        let ok = self.bft_verify_new_block(&req.new_block.hash, &req.src, &req.new_block);
        let signature = if ok {
            Some(self.keypair.sign(&req.new_block.hash.bytes()))
        } else {
            None
        };
        self.send_to_public(
            origin,
            Message::SignNewBlockReply(SignReply {
                request_id: req.request_id,
                signature,
            }),
        );
    }

    fn handle_sign_follow_block(&self, origin: &PublicKeyBytes, req: SignFollowBlockRequest) {
        let ok = self.bft_verify_follow_block(&req.forward.newest.hash, &req.forward);
        let signature = if ok {
            Some(self.keypair.sign(&req.forward.newest.hash.bytes()))
        } else {
            None
        };
        self.send_to_public(
            origin,
            Message::SignFollowBlockReply(SignReply {
                request_id: req.request_id,
                signature,
            }),
        );
    }

    fn handle_get_update(&self, origin: &PublicKeyBytes, req: BlockRequest) {
        let block = self.store.get_latest(&req.id).ok();
        self.send_to_public(
            origin,
            Message::BlockReply(BlockReply {
                request_id: req.request_id,
                block,
            }),
        );
    }

    fn handle_get_block(&self, origin: &PublicKeyBytes, req: BlockRequest) {
        let block = self.store.get_by_id(&req.id);
        if block.is_none() {
            log::debug!("did not find requested block {}", req.id.short());
        }
        self.send_to_public(
            origin,
            Message::BlockReply(BlockReply {
                request_id: req.request_id,
                block,
            }),
        );
    }

    fn handle_block_reply(&self, reply: BlockReply) {
        if let Some(block) = &reply.block {
            match self.store.verify_links(block) {
                Ok(()) => {
                    self.store.store(block.clone());
                    self.save();
                }
                Err(err) => log::warn!("received invalid skipblock: {}", err),
            }
        }
        let waiters = self.waiters.lock().unwrap();
        if let Some(waiter) = waiters.get(&reply.request_id) {
            let _ = waiter.send(RoundReply::Block(reply.block));
        }
    }

    fn handle_sign_reply(&self, origin: &PublicKeyBytes, reply: SignReply) {
        let waiters = self.waiters.lock().unwrap();
        if let Some(waiter) = waiters.get(&reply.request_id) {
            let _ = waiter.send(RoundReply::Signature {
                from: *origin,
                signature: reply.signature,
            });
        }
    }

    /// Answer a roster-extension query. Runs on the worker pool because it refreshes the
    /// followed latest blocks over the network first.
    fn handle_extend_roster(&self, origin: PublicKeyBytes, req: ExtendRosterRequest) {
        let followed: Vec<SkipBlock> = self.follow.lock().unwrap().follow.clone();
        for sb in &followed {
            let Some(target) = sb.roster.random_other_member(&self.identity.public) else {
                continue;
            };
            let target = target.clone();
            if let Some(updated) = self.fetch_update_from(&target, sb.hash) {
                if updated.skip_chain_id() == sb.skip_chain_id() {
                    let mut follow = self.follow.lock().unwrap();
                    if let Some(entry) = follow
                        .follow
                        .iter_mut()
                        .find(|f| f.skip_chain_id() == sb.skip_chain_id())
                    {
                        *entry = updated;
                    }
                }
            }
        }

        let accept = {
            let follow = self.follow.lock().unwrap();
            follow.in_followed_roster(&origin) || follow.follow_ids.contains(&req.genesis)
        };
        let signature = if accept {
            Some(self.keypair.sign(&req.genesis.bytes()))
        } else {
            log::debug!(
                "{} refusing to join roster for chain {}",
                self.identity.address,
                req.genesis.short()
            );
            None
        };
        self.send_to_public(
            &origin,
            Message::ExtendRosterReply(SignReply {
                request_id: req.request_id,
                signature,
            }),
        );
    }

    /// Apply a propagated batch of blocks. Runs on the worker pool; a block that fails
    /// verification or the friendliness check aborts the batch silently.
    fn handle_propagate(&self, blocks: Vec<SkipBlock>) {
        self.propagations.fetch_add(1, Ordering::SeqCst);
        for block in blocks {
            if block.calculate_hash() != block.hash {
                log::error!("propagated block {} has a wrong hash", block.hash.short());
                break;
            }
            if let Err(err) = block.verify_forward_signatures_recursive(&self.store) {
                log::error!("{}", err);
                break;
            }
            let friendly = {
                let follow = self.follow.lock().unwrap();
                block_is_friendly(&follow, &self.store, &self.identity.public, &block)
            };
            if !friendly {
                log::debug!(
                    "{}: block is not friendly: {}",
                    self.identity.address,
                    block.hash.short()
                );
                break;
            }
            self.store.store(block);
            self.save();
        }
        self.propagations.fetch_sub(1, Ordering::SeqCst);
    }

    /* ↓↓↓ Plumbing ↓↓↓ */

    fn next_request_id(&self) -> RequestId {
        RequestId::new(self.next_request.fetch_add(1, Ordering::SeqCst))
    }

    fn register_waiter(&self, request_id: RequestId) -> (Receiver<RoundReply>, WaiterGuard<N, S>) {
        let (sender, receiver) = mpsc::channel();
        self.waiters.lock().unwrap().insert(request_id, sender);
        (
            receiver,
            WaiterGuard {
                inner: self,
                request_id,
            },
        )
    }

    fn send_to(&self, si: &ServerIdentity, message: Message) -> Result<(), ServiceError> {
        let key = si.verifying_key().map_err(|_| {
            ServiceError::Transport(format!("invalid public key for {}", si.address))
        })?;
        self.network.lock().unwrap().send(key, message);
        Ok(())
    }

    fn send_to_public(&self, public: &PublicKeyBytes, message: Message) {
        match ed25519_dalek::VerifyingKey::from_bytes(&public.bytes()) {
            Ok(key) => self.network.lock().unwrap().send(key, message),
            Err(_) => log::warn!("cannot reply to peer with invalid public key"),
        }
    }

    /// Claim the single append slot. At most one block is formed at a time on this
    /// conode, whichever chain it extends.
    fn start_append(&self, id: SkipBlockID) -> Result<AppendGuard<N, S>, ServiceError> {
        let mut new_blocks = self.new_blocks.lock().unwrap();
        if !new_blocks.is_empty() {
            return Err(ServiceError::BlockInProgress(
                "this skipchain is currently processing a block".to_string(),
            ));
        }
        new_blocks.insert(id);
        Ok(AppendGuard { inner: self, id })
    }

    fn known_identities(&self) -> HashMap<PublicKeyBytes, ServerIdentity> {
        let mut identities = HashMap::new();
        {
            let follow = self.follow.lock().unwrap();
            for sb in &follow.follow {
                for si in sb.roster.iter() {
                    identities.insert(si.public, si.clone());
                }
            }
        }
        for sb in self.store.all_blocks() {
            for si in sb.roster.iter() {
                identities.insert(si.public, si.clone());
            }
        }
        identities
    }

    fn identity_by_address(&self, address: &Address) -> Option<ServerIdentity> {
        self.known_identities()
            .into_values()
            .find(|si| si.address == *address)
    }

    fn save(&self) {
        let record = {
            let follow = self.follow.lock().unwrap();
            StorageRecord {
                blocks: self.store.all_blocks(),
                follow: follow.follow.clone(),
                follow_ids: follow.follow_ids.clone(),
                clients: follow.clients.clone(),
                auth_level: follow.auth_level,
            }
        };
        self.persister.save(&record);
    }
}

/// Removes a round's waiter when the round returns, keeping the waiter map bounded.
struct WaiterGuard<'a, N: Network, S: SnapshotStore> {
    inner: &'a ServiceInner<N, S>,
    request_id: RequestId,
}

impl<N: Network, S: SnapshotStore> Drop for WaiterGuard<'_, N, S> {
    fn drop(&mut self) {
        self.inner.waiters.lock().unwrap().remove(&self.request_id);
    }
}

/// Releases the append slot when the append returns.
struct AppendGuard<'a, N: Network, S: SnapshotStore> {
    inner: &'a ServiceInner<N, S>,
    id: SkipBlockID,
}

impl<N: Network, S: SnapshotStore> Drop for AppendGuard<'_, N, S> {
    fn drop(&mut self) {
        self.inner.new_blocks.lock().unwrap().remove(&self.id);
    }
}

/// The handler thread: polls the network and dispatches messages. Handlers that wait on
/// the network themselves (roster-extension refresh, propagation receipt) run on the
/// worker pool so the loop stays live.
fn message_loop<N: Network, S: SnapshotStore>(
    inner: Arc<ServiceInner<N, S>>,
    shutdown: Receiver<()>,
) {
    loop {
        match shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }
        let received = inner.network.lock().unwrap().recv();
        let Some((origin, message)) = received else {
            thread::sleep(inner.config.recv_poll_interval);
            continue;
        };
        let origin = PublicKeyBytes::new(origin.to_bytes());
        match message {
            Message::SignNewBlock(req) => inner.handle_sign_new_block(&origin, req),
            Message::SignFollowBlock(req) => inner.handle_sign_follow_block(&origin, req),
            Message::GetUpdate(req) => inner.handle_get_update(&origin, req),
            Message::GetBlock(req) => inner.handle_get_block(&origin, req),
            Message::BlockReply(reply) => inner.handle_block_reply(reply),
            Message::SignNewBlockReply(reply)
            | Message::SignFollowBlockReply(reply)
            | Message::ExtendRosterReply(reply) => inner.handle_sign_reply(&origin, reply),
            Message::ExtendRoster(req) => {
                let worker = Arc::clone(&inner);
                inner
                    .pool
                    .lock()
                    .unwrap()
                    .execute(move || worker.handle_extend_roster(origin, req));
            }
            Message::Propagate(propagate) => {
                let worker = Arc::clone(&inner);
                inner
                    .pool
                    .lock()
                    .unwrap()
                    .execute(move || worker.handle_propagate(propagate.skip_blocks));
            }
        }
    }
}

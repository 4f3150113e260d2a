/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The in-memory skipblock store.
//!
//! All known blocks, keyed by hash, behind one read-write lock: concurrent readers, writes
//! serialized. Forward links and child lists only ever grow; [SkipBlockMap::store] merges
//! an incoming copy of a known block instead of replacing it, so a stale copy can never
//! shrink the mutable part of a block.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::RwLock;

use log;

use crate::errors::ServiceError;
use crate::types::basic::SkipBlockID;
use crate::types::block::{ForwardLink, SkipBlock};

pub struct SkipBlockMap {
    blocks: RwLock<HashMap<SkipBlockID, SkipBlock>>,
}

impl SkipBlockMap {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_blocks(blocks: Vec<SkipBlock>) -> Self {
        let map = Self::new();
        for block in blocks {
            map.store(block);
        }
        map
    }

    /// Insert a block, or merge it into the already-stored copy. Merging extends forward
    /// links and child chains monotonically; a conflicting forward link in the incoming
    /// copy is ignored and logged, never overwritten.
    pub fn store(&self, block: SkipBlock) -> SkipBlockID {
        let id = block.hash;
        let mut blocks = self.blocks.write().unwrap();
        match blocks.entry(id) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                for (height, link) in block.forward_links.iter().enumerate() {
                    if height < existing.forward_len() {
                        if existing.forward_links[height].to != link.to {
                            log::warn!(
                                "ignoring conflicting forward link at height {} of block {}",
                                height,
                                id.short()
                            );
                        }
                    } else if height == existing.forward_len() {
                        existing.forward_links.push(link.clone());
                    }
                }
                for child in &block.child_chains {
                    if !existing.child_chains.contains(child) {
                        existing.child_chains.push(*child);
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(block);
            }
        }
        id
    }

    pub fn get_by_id(&self, id: &SkipBlockID) -> Option<SkipBlock> {
        self.blocks.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &SkipBlockID) -> bool {
        self.blocks.read().unwrap().contains_key(id)
    }

    /// The latest locally known block reachable from `id`, walking the highest forward
    /// link of each block until a block without forward links, or with a forward link to a
    /// block we do not hold, is reached.
    pub fn get_latest(&self, id: &SkipBlockID) -> Result<SkipBlock, ServiceError> {
        let blocks = self.blocks.read().unwrap();
        let mut current = blocks
            .get(id)
            .ok_or_else(|| ServiceError::BlockNotFound(format!("no block {}", id.short())))?;
        while let Some(link) = current.forward_links.last() {
            match blocks.get(&link.to) {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(current.clone())
    }

    /// Find the unique stored block whose hex-encoded hash starts with `prefix`. More than
    /// one match is an error; no match is `None`.
    pub fn get_fuzzy(&self, prefix: &str) -> Result<Option<SkipBlock>, ServiceError> {
        let blocks = self.blocks.read().unwrap();
        let mut found: Option<&SkipBlock> = None;
        for (id, block) in blocks.iter() {
            if hex::encode(id.bytes()).starts_with(prefix) {
                if found.is_some() {
                    return Err(ServiceError::ParameterWrong(format!(
                        "prefix {} matches more than one block",
                        prefix
                    )));
                }
                found = Some(block);
            }
        }
        Ok(found.cloned())
    }

    pub fn len(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().unwrap().is_empty()
    }

    /// One block per distinct chain id: the stored block with the highest index.
    pub fn latest_per_chain(&self) -> Vec<SkipBlock> {
        let blocks = self.blocks.read().unwrap();
        let mut chains: HashMap<SkipBlockID, &SkipBlock> = HashMap::new();
        for block in blocks.values() {
            match chains.entry(block.skip_chain_id()) {
                Entry::Occupied(mut occupied) => {
                    if block.index > occupied.get().index {
                        occupied.insert(block);
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(block);
                }
            }
        }
        chains.into_values().cloned().collect()
    }

    /// Every stored block, for snapshotting.
    pub fn all_blocks(&self) -> Vec<SkipBlock> {
        self.blocks.read().unwrap().values().cloned().collect()
    }

    /// Admission check for a block arriving from another conode: the hash must be
    /// canonical, every forward link — including those of anchored child-chain genesis
    /// blocks, recursively — must carry a correct collective signature, and the block
    /// must be consistent with the locally stored part of its chain — each stored
    /// back-linked ancestor must belong to the same chain and, where it already carries a
    /// forward link at the matching height, that link must point at this very block. A
    /// missing immediate predecessor is only tolerated for chains we do not hold at all.
    pub fn verify_links(&self, block: &SkipBlock) -> Result<(), ServiceError> {
        if block.hash != block.calculate_hash() {
            return Err(ServiceError::Verification(format!(
                "block {} does not hash to its id",
                block.hash.short()
            )));
        }
        block.check_structure()?;
        block.verify_forward_signatures_recursive(self)?;
        if block.is_genesis() {
            return Ok(());
        }

        let blocks = self.blocks.read().unwrap();
        for (height, back_id) in block.back_link_ids.iter().enumerate() {
            match blocks.get(back_id) {
                Some(back) => {
                    if back.skip_chain_id() != block.skip_chain_id() {
                        return Err(ServiceError::Verification(format!(
                            "back link {} of block {} crosses chains",
                            height,
                            block.hash.short()
                        )));
                    }
                    if let Some(link) = back.get_forward(height) {
                        if link.to != block.hash {
                            return Err(ServiceError::Verification(format!(
                                "block {} conflicts with forward link at height {} of {}",
                                block.hash.short(),
                                height,
                                back_id.short()
                            )));
                        }
                    }
                }
                None => {
                    if height == 0 && blocks.contains_key(&block.skip_chain_id()) {
                        return Err(ServiceError::Verification(format!(
                            "predecessor {} of block {} missing",
                            back_id.short(),
                            block.hash.short()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Append a forward link to the stored copy of `src`, at exactly the next free height.
    /// Fails when another link was attached there in the meantime, which is how two racing
    /// appends are serialized. Returns the updated block.
    pub fn attach_forward(
        &self,
        src: &SkipBlockID,
        height: usize,
        link: ForwardLink,
    ) -> Result<SkipBlock, ServiceError> {
        let mut blocks = self.blocks.write().unwrap();
        let block = blocks
            .get_mut(src)
            .ok_or_else(|| ServiceError::BlockNotFound(format!("no block {}", src.short())))?;
        if block.forward_len() > height {
            return Err(ServiceError::BlockContent(format!(
                "block {} already has a forward link at height {}",
                src.short(),
                height
            )));
        }
        if block.forward_len() < height {
            return Err(ServiceError::BlockContent(format!(
                "cannot attach forward link at height {} of block {}: only {} present",
                height,
                src.short(),
                block.forward_len()
            )));
        }
        block.forward_links.push(link);
        Ok(block.clone())
    }

    /// Record `child` as a child-chain genesis anchored at `parent`. Returns the updated
    /// parent.
    pub fn add_child(
        &self,
        parent: &SkipBlockID,
        child: SkipBlockID,
    ) -> Result<SkipBlock, ServiceError> {
        let mut blocks = self.blocks.write().unwrap();
        let block = blocks.get_mut(parent).ok_or_else(|| {
            ServiceError::BlockNoParent(format!("no parent block {}", parent.short()))
        })?;
        if !block.child_chains.contains(&child) {
            block.child_chains.push(child);
        }
        Ok(block.clone())
    }
}

impl Default for SkipBlockMap {
    fn default() -> Self {
        Self::new()
    }
}

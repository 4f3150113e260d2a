/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Durable snapshots of the service state.
//!
//! The whole mutable state of a conode — block store, follow configuration, linked client
//! keys and the authentication level — is borsh-serialized into one record and written
//! under a single key through the operator-provided [SnapshotStore]. Writes are
//! rate-limited to at most one per quiet window; the snapshot is loaded once at startup,
//! and a present-but-undecodable snapshot is a startup error.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use crate::types::basic::{PublicKeyBytes, SkipBlockID};
use crate::types::block::SkipBlock;

/// Key under which the one snapshot record is stored.
pub const SKIPBLOCKS_KEY: &[u8] = b"skipblocks";

/// Trait for the pluggable durable key-value store backing a conode.
pub trait SnapshotStore: Clone + Send + 'static {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&mut self, key: &[u8], value: &[u8]);
}

/// Everything a conode persists.
#[derive(Clone, BorshDeserialize, BorshSerialize)]
pub struct StorageRecord {
    pub blocks: Vec<SkipBlock>,
    pub follow: Vec<SkipBlock>,
    pub follow_ids: Vec<SkipBlockID>,
    pub clients: Vec<PublicKeyBytes>,
    pub auth_level: u8,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("corrupt snapshot: {0}")]
    Corrupt(std::io::Error),
}

/// Writes [StorageRecord]s through a [SnapshotStore], at most once per quiet window.
pub struct Persister<S: SnapshotStore> {
    store: Mutex<S>,
    last_save: Mutex<Instant>,
    quiet_window: Duration,
}

impl<S: SnapshotStore> Persister<S> {
    pub fn new(store: S, quiet_window: Duration) -> Self {
        Self {
            store: Mutex::new(store),
            last_save: Mutex::new(Instant::now()),
            quiet_window,
        }
    }

    /// Load the snapshot, if one exists.
    pub fn load(&self) -> Result<Option<StorageRecord>, SnapshotError> {
        let bytes = match self.store.lock().unwrap().get(SKIPBLOCKS_KEY) {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let record = StorageRecord::try_from_slice(&bytes).map_err(SnapshotError::Corrupt)?;
        Ok(Some(record))
    }

    /// Write the snapshot unless the previous write is more recent than the quiet window.
    pub fn save(&self, record: &StorageRecord) {
        {
            let mut last_save = self.last_save.lock().unwrap();
            if last_save.elapsed() < self.quiet_window {
                return;
            }
            *last_save = Instant::now();
        }
        log::debug!("saving service snapshot with {} blocks", record.blocks.len());
        let bytes = match record.try_to_vec() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("couldn't serialize snapshot: {}", err);
                return;
            }
        };
        self.store.lock().unwrap().set(SKIPBLOCKS_KEY, &bytes);
    }
}

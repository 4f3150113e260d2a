//! A simple, volatile, in-memory implementation of [`SnapshotStore`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use skipchain::persistence::SnapshotStore;

/// An in-memory implementation of [`SnapshotStore`]. Clones share the same map, so a
/// restarted service can be handed a clone to observe the previous instance's snapshot.
#[derive(Clone)]
pub(crate) struct MemDB(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemDB {
    /// Create a new, empty `MemDB`.
    pub(crate) fn new() -> MemDB {
        MemDB(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl SnapshotStore for MemDB {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.lock().unwrap().insert(key.to_vec(), value.to_vec());
    }
}

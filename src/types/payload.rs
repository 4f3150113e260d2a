/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The opaque payload carried by a skipblock.
//!
//! A payload is either a raw byte string or a typed value: the marshalled bytes of some
//! application type, tagged with a [PayloadTypeID] that can be resolved against a
//! [PayloadRegistry]. The service never interprets payload bytes itself; typed payloads
//! exist so that chain verifiers and clients can agree on what a block carries.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::HashMap;

/// Tags the application type of a [Payload::Typed] value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, BorshDeserialize, BorshSerialize)]
pub struct PayloadTypeID(u32);

impl PayloadTypeID {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Data stored in a skipblock.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub enum Payload {
    Bytes(Vec<u8>),
    Typed(PayloadTypeID, Vec<u8>),
}

impl Payload {
    pub fn empty() -> Payload {
        Payload::Bytes(Vec::new())
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Typed(_, bytes) => bytes,
        }
    }

    pub fn type_id(&self) -> Option<PayloadTypeID> {
        match self {
            Payload::Bytes(_) => None,
            Payload::Typed(type_id, _) => Some(*type_id),
        }
    }
}

/// Maps payload type ids to human-readable names. Held by the service; registration is
/// first-come, a second registration under the same id is rejected.
#[derive(Default)]
pub struct PayloadRegistry {
    names: HashMap<PayloadTypeID, &'static str>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_id: PayloadTypeID, name: &'static str) -> bool {
        if self.names.contains_key(&type_id) {
            return false;
        }
        self.names.insert(type_id, name);
        true
    }

    pub fn name_of(&self, type_id: &PayloadTypeID) -> Option<&'static str> {
        self.names.get(type_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicate_registration() {
        let mut registry = PayloadRegistry::new();
        let id = PayloadTypeID::new(7);
        assert!(registry.register(id, "party-config"));
        assert!(!registry.register(id, "something-else"));
        assert_eq!(registry.name_of(&id), Some("party-config"));
    }

    #[test]
    fn typed_payload_exposes_tag_and_bytes() {
        let payload = Payload::Typed(PayloadTypeID::new(1), vec![1, 2, 3]);
        assert_eq!(payload.type_id(), Some(PayloadTypeID::new(1)));
        assert_eq!(payload.bytes(), &[1, 2, 3]);
        assert_eq!(Payload::empty().type_id(), None);
    }
}

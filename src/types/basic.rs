/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inert types shared across the service and its sub-protocols. These follow the newtype
//! pattern: they are sent around and inspected, but have no active behaviour of their own.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Debug, Display, Formatter};

/// Content hash of a skipblock's immutable part. Identifies the block everywhere.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct SkipBlockID([u8; 32]);

impl SkipBlockID {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// First four bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[0..4])
    }
}

impl Display for SkipBlockID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for SkipBlockID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SkipBlockID({})", self.short())
    }
}

/// An Ed25519 public key in byte form. Conversion into a usable verifying key happens at
/// the point of signature verification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct PublicKeyBytes([u8; 32]);

impl PublicKeyBytes {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", hex::encode(&self.0[0..4]))
    }
}

/// Signature represented in bytes.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({})", hex::encode(&self.0[0..4]))
    }
}

/// Set of signatures, represented as a vector with the size of a given roster.
/// The value at a particular position is either:
/// 1. None: if a valid signature from the roster member at the given position has not been
///    obtained, or
/// 2. Some(signature_bytes): if signature_bytes has been obtained from the member at the
///    given position.
#[derive(Clone, PartialEq, Eq, Debug, BorshDeserialize, BorshSerialize)]
pub struct SignatureSet(Vec<Option<SignatureBytes>>);

impl SignatureSet {
    pub fn new(len: usize) -> Self {
        Self(vec![None; len])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Option<SignatureBytes>> {
        self.0.iter()
    }

    pub fn get(&self, pos: usize) -> &Option<SignatureBytes> {
        &self.0[pos]
    }

    pub fn set(&mut self, pos: usize, value: Option<SignatureBytes>) {
        self.0[pos] = value
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of positions holding a signature.
    pub fn count_present(&self) -> usize {
        self.0.iter().filter(|sig| sig.is_some()).count()
    }
}

/// Identifies one in-flight sub-protocol round. Fetch and signing waiters are keyed by
/// request id, not block hash, so simultaneous rounds over the same block do not collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, BorshDeserialize, BorshSerialize)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Network address of a conode, in "ip:port" form.
#[derive(Clone, PartialEq, Eq, Hash, Debug, BorshDeserialize, BorshSerialize)]
pub struct Address(String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn str(&self) -> &str {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a domain verification function applied to every block appended to a chain
/// carrying this id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct VerifierID([u8; 16]);

impl VerifierID {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl Debug for VerifierID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Ids are derived from short ASCII tags; print them as such.
        let tag: String = self
            .0
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect();
        write!(f, "VerifierID({})", tag)
    }
}

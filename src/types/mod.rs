/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types common across the service and its sub-protocols: inert newtypes in
//! [basic], cryptographic primitives in [crypto_primitives], identities and rosters in
//! [roster], the block payload in [payload], and the skipblock itself in [block].

pub mod basic;

pub mod block;

pub mod crypto_primitives;

pub mod payload;

pub mod roster;

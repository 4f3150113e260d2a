/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Errors returned to clients of the skipchain service.
//!
//! Every variant carries a human-readable message and maps onto a stable numeric code via
//! [ServiceError::code], so front-ends talking to remote conodes can switch on the code
//! while operators read the message.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// A block or chain is absent locally and could not be fetched.
    #[error("block not found: {0}")]
    BlockNotFound(String),

    /// A parent block should be there but has not been found.
    #[error("missing parent block: {0}")]
    BlockNoParent(String),

    /// Part of a block is in an invalid state, or the access-control policy refused it.
    #[error("invalid block content: {0}")]
    BlockContent(String),

    /// A given parameter is out of bounds, malformed, or unauthenticated.
    #[error("wrong parameter: {0}")]
    ParameterWrong(String),

    /// A block or signature could not be verified.
    #[error("verification failed: {0}")]
    Verification(String),

    /// A network round-trip or (de)serialization failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A block for this chain is currently being formed and propagated.
    #[error("block in progress: {0}")]
    BlockInProgress(String),
}

impl ServiceError {
    /// The stable client-facing error code of this variant.
    pub const fn code(&self) -> u16 {
        match self {
            ServiceError::BlockNotFound(_) => 4100,
            ServiceError::BlockNoParent(_) => 4101,
            ServiceError::BlockContent(_) => 4102,
            ServiceError::ParameterWrong(_) => 4103,
            ServiceError::Verification(_) => 4104,
            ServiceError::Transport(_) => 4105,
            ServiceError::BlockInProgress(_) => 4106,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Transport(err.to_string())
    }
}

// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type SignetResult<T> = Result<T, SignetError>;

#[derive(Debug, Error)]
pub enum SignetError {
    #[error("non-finite numbers are not representable in canonical JSON")]
    NonFiniteNumber,

    #[error("canonical JSON requires string object keys")]
    NonStringKey,

    #[error("no mapping registered for {from} -> {target}")]
    NoMapping { from: String, target: String },

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("chain verification failed at hop {hop}: {reason}")]
    ChainIntegrity { hop: u64, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::SignetResult;
use crate::jcs;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub type Hash32 = [u8; 32];

pub const CID_PREFIX: &str = "sha256:";
pub const HASH_ALGO: &str = "sha256";

pub fn sha256(bytes: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

/// Content identifier of a JSON value: `sha256:` + hex of the digest of
/// its canonical bytes.
pub fn cid_for_value(v: &Value) -> SignetResult<String> {
    let canon = jcs::canonical_bytes(v)?;
    Ok(format!("{CID_PREFIX}{}", sha256_hex(&canon)))
}

pub fn is_cid(s: &str) -> bool {
    s.strip_prefix(CID_PREFIX)
        .map(|hexpart| hexpart.len() == 64 && hexpart.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}

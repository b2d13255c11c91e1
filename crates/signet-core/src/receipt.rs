// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hash-chained exchange receipts.
//!
//! A receipt binds the canonical bytes of a normalized payload to a trace
//! position. `receipt_hash` (and the detached signature) cover the
//! canonical receipt with the seal fields themselves removed, so a sealed
//! receipt can be re-verified by stripping `receipt_hash`, `signature`,
//! and `kid` and recomputing.

use crate::cid::{sha256_hex, CID_PREFIX};
use crate::error::{SignetError, SignetResult};
use crate::jcs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields excluded from the hashed/signed canonical form.
pub const SEAL_FIELDS: [&str; 3] = ["receipt_hash", "signature", "kid"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBlock {
    pub engine: String,
    pub allowed: bool,
    pub reason: String,
}

impl PolicyBlock {
    pub fn allowed(reason: impl Into<String>) -> Self {
        Self {
            engine: "HEL".to_string(),
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            engine: "HEL".to_string(),
            allowed: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedBlock {
    pub url: String,
    pub status_code: u16,
    pub host: String,
    pub pinned_ip: String,
    pub response_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub trace_id: String,
    pub hop: u64,
    pub ts: String,
    pub tenant: String,
    pub cid: String,
    pub canon: String,
    pub algo: String,
    pub prev_receipt_hash: Option<String>,
    pub policy: PolicyBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded: Option<ForwardedBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fu_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_violations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Receipt {
    /// Canonical bytes of the receipt with the seal fields removed. This is
    /// both the hashing preimage and the signing payload.
    pub fn seal_payload(&self) -> SignetResult<Vec<u8>> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| SignetError::Internal(format!("receipt serialization: {e}")))?;
        if let Value::Object(map) = &mut value {
            for field in SEAL_FIELDS {
                map.remove(field);
            }
        }
        jcs::canonical_bytes(&value)
    }

    pub fn compute_hash(&self) -> SignetResult<String> {
        Ok(format!("{CID_PREFIX}{}", sha256_hex(&self.seal_payload()?)))
    }

    /// Attach the hash and signature envelope. `compute_hash` before and
    /// after sealing agree because the seal fields are excluded.
    pub fn seal(&mut self, signature_b64: String, kid: String) -> SignetResult<()> {
        let hash = self.compute_hash()?;
        self.receipt_hash = Some(hash);
        self.signature = Some(signature_b64);
        self.kid = Some(kid);
        Ok(())
    }

    pub fn verify_hash(&self) -> SignetResult<()> {
        let stored = self
            .receipt_hash
            .as_deref()
            .ok_or_else(|| SignetError::ChainIntegrity {
                hop: self.hop,
                reason: "receipt is unsealed".to_string(),
            })?;
        let computed = self.compute_hash()?;
        if stored != computed {
            return Err(SignetError::ChainIntegrity {
                hop: self.hop,
                reason: format!("receipt_hash mismatch: stored {stored}, computed {computed}"),
            });
        }
        Ok(())
    }
}

/// Verify hash integrity and linkage of an ordered chain: hop numbering
/// starts at 1 and increases by one, `prev_receipt_hash` is null exactly at
/// the genesis receipt, and every link matches the predecessor's hash.
pub fn verify_chain(receipts: &[Receipt]) -> SignetResult<()> {
    for (i, receipt) in receipts.iter().enumerate() {
        receipt.verify_hash()?;
        let expected_hop = i as u64 + 1;
        if receipt.hop != expected_hop {
            return Err(SignetError::ChainIntegrity {
                hop: receipt.hop,
                reason: format!("expected hop {expected_hop}"),
            });
        }
        if i == 0 {
            if receipt.prev_receipt_hash.is_some() {
                return Err(SignetError::ChainIntegrity {
                    hop: receipt.hop,
                    reason: "genesis receipt carries prev_receipt_hash".to_string(),
                });
            }
        } else {
            let prev = &receipts[i - 1];
            if receipt.trace_id != prev.trace_id {
                return Err(SignetError::ChainIntegrity {
                    hop: receipt.hop,
                    reason: "trace_id changes mid-chain".to_string(),
                });
            }
            if receipt.prev_receipt_hash.as_deref() != prev.receipt_hash.as_deref() {
                return Err(SignetError::ChainIntegrity {
                    hop: receipt.hop,
                    reason: "prev_receipt_hash does not match predecessor".to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::HASH_ALGO;

    fn receipt(trace: &str, hop: u64, prev: Option<String>) -> Receipt {
        let mut r = Receipt {
            trace_id: trace.to_string(),
            hop,
            ts: "2026-01-02T03:04:05Z".to_string(),
            tenant: "acme".to_string(),
            cid: "sha256:00".to_string(),
            canon: "{}".to_string(),
            algo: HASH_ALGO.to_string(),
            prev_receipt_hash: prev,
            policy: PolicyBlock::allowed("ok"),
            forwarded: None,
            fallback_used: None,
            fu_tokens: None,
            semantic_violations: None,
            receipt_hash: None,
            signature: None,
            kid: None,
        };
        r.seal("c2ln".to_string(), "key-1".to_string()).unwrap();
        r
    }

    fn chain_of(len: u64) -> Vec<Receipt> {
        let mut out: Vec<Receipt> = Vec::new();
        for hop in 1..=len {
            let prev = out.last().and_then(|r: &Receipt| r.receipt_hash.clone());
            out.push(receipt("trace-1", hop, prev));
        }
        out
    }

    #[test]
    fn sealing_does_not_change_the_hash_preimage() {
        let r = receipt("trace-1", 1, None);
        assert_eq!(r.compute_hash().unwrap(), r.receipt_hash.clone().unwrap());
        r.verify_hash().unwrap();
    }

    #[test]
    fn valid_chain_verifies() {
        verify_chain(&chain_of(3)).unwrap();
    }

    #[test]
    fn mutated_canon_fails_hash_verification() {
        let mut chain = chain_of(2);
        chain[1].canon.push(' ');
        let err = verify_chain(&chain).unwrap_err();
        assert!(matches!(err, SignetError::ChainIntegrity { hop: 2, .. }));
    }

    #[test]
    fn broken_linkage_is_detected() {
        let mut chain = chain_of(3);
        chain[2].prev_receipt_hash = Some("sha256:deadbeef".to_string());
        // Re-seal so the hash itself is consistent; only the link is wrong.
        let mut tampered = chain[2].clone();
        tampered.receipt_hash = None;
        tampered
            .seal("c2ln".to_string(), "key-1".to_string())
            .unwrap();
        chain[2] = tampered;
        assert!(verify_chain(&chain).is_err());
    }

    #[test]
    fn genesis_must_not_link_backwards() {
        let mut chain = chain_of(1);
        chain[0].prev_receipt_hash = Some("sha256:ff".to_string());
        let mut resealed = chain[0].clone();
        resealed.receipt_hash = None;
        resealed
            .seal("c2ln".to_string(), "key-1".to_string())
            .unwrap();
        assert!(verify_chain(&[resealed]).is_err());
    }

    #[test]
    fn hop_numbering_must_be_dense() {
        let mut chain = chain_of(2);
        chain[1].hop = 3;
        let mut resealed = chain[1].clone();
        resealed.receipt_hash = None;
        resealed
            .seal("c2ln".to_string(), "key-1".to_string())
            .unwrap();
        chain[1] = resealed;
        assert!(verify_chain(&chain).is_err());
    }
}

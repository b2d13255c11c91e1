// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Offline verification for Signet receipts, chains, and export bundles.
//!
//! Auditors embed this crate to check material obtained from a Signet
//! deployment without trusting it: receipt hashes and linkage are
//! recomputed from canonical bytes, and detached Ed25519 signatures are
//! resolved through the published key set.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::Value;
use signet_core::cid::cid_for_value;
use signet_core::receipt::{self, Receipt};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("key set does not advertise kid {0}")]
    UnknownKid(String),

    #[error("receipt is missing its signature envelope")]
    MissingSeal,

    #[error("signature verification failed")]
    Signature,

    #[error("malformed key material: {0}")]
    KeyMaterial(String),

    #[error("malformed bundle: {0}")]
    Bundle(String),

    #[error(transparent)]
    Integrity(#[from] signet_core::SignetError),
}

/// Verifier-side view of the published JWKS.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, VerifyingKey>,
}

impl KeySet {
    pub fn insert(&mut self, kid: impl Into<String>, key: VerifyingKey) {
        self.keys.insert(kid.into(), key);
    }

    pub fn get(&self, kid: &str) -> Option<&VerifyingKey> {
        self.keys.get(kid)
    }

    /// Parse a JWKS document, accepting only Ed25519 OKP entries.
    pub fn from_jwks(jwks: &Value) -> Result<Self, VerifyError> {
        let mut out = Self::default();
        let entries = jwks
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| VerifyError::KeyMaterial("jwks missing keys array".to_string()))?;
        for entry in entries {
            let kty = entry.get("kty").and_then(Value::as_str);
            let crv = entry.get("crv").and_then(Value::as_str);
            if kty != Some("OKP") || crv != Some("Ed25519") {
                continue;
            }
            let kid = entry
                .get("kid")
                .and_then(Value::as_str)
                .ok_or_else(|| VerifyError::KeyMaterial("jwk missing kid".to_string()))?;
            let x = entry
                .get("x")
                .and_then(Value::as_str)
                .ok_or_else(|| VerifyError::KeyMaterial("jwk missing x".to_string()))?;
            let raw = URL_SAFE_NO_PAD
                .decode(x)
                .map_err(|e| VerifyError::KeyMaterial(format!("jwk x: {e}")))?;
            let raw: [u8; 32] = raw
                .try_into()
                .map_err(|_| VerifyError::KeyMaterial("jwk x must be 32 bytes".to_string()))?;
            let key = VerifyingKey::from_bytes(&raw)
                .map_err(|e| VerifyError::KeyMaterial(format!("jwk x: {e}")))?;
            out.insert(kid, key);
        }
        Ok(out)
    }
}

fn decode_signature(b64: &str) -> Result<Signature, VerifyError> {
    let raw = STANDARD.decode(b64).map_err(|_| VerifyError::Signature)?;
    let raw: [u8; 64] = raw.try_into().map_err(|_| VerifyError::Signature)?;
    Ok(Signature::from_bytes(&raw))
}

/// Verify the detached signature over a receipt's canonical seal payload.
pub fn verify_receipt_signature(receipt: &Receipt, keys: &KeySet) -> Result<(), VerifyError> {
    let (Some(signature), Some(kid)) = (receipt.signature.as_deref(), receipt.kid.as_deref())
    else {
        return Err(VerifyError::MissingSeal);
    };
    let key = keys
        .get(kid)
        .ok_or_else(|| VerifyError::UnknownKid(kid.to_string()))?;
    let payload = receipt.seal_payload()?;
    let signature = decode_signature(signature)?;
    key.verify(&payload, &signature)
        .map_err(|_| VerifyError::Signature)
}

/// Full chain verification: hash integrity and linkage, then every
/// receipt's signature.
pub fn verify_chain(receipts: &[Receipt], keys: &KeySet) -> Result<(), VerifyError> {
    receipt::verify_chain(receipts)?;
    for r in receipts {
        verify_receipt_signature(r, keys)?;
    }
    Ok(())
}

/// Verify an export bundle: recompute the bundle CID over
/// `{trace_id, chain, exported_at}` and check the detached signature over
/// the CID string, then verify the embedded chain.
pub fn verify_bundle(bundle: &Value, keys: &KeySet) -> Result<(), VerifyError> {
    let trace_id = bundle
        .get("trace_id")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::Bundle("missing trace_id".to_string()))?;
    let chain_value = bundle
        .get("chain")
        .ok_or_else(|| VerifyError::Bundle("missing chain".to_string()))?;
    let exported_at = bundle
        .get("exported_at")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::Bundle("missing exported_at".to_string()))?;
    let claimed_cid = bundle
        .get("bundle_cid")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::Bundle("missing bundle_cid".to_string()))?;
    let signature = bundle
        .get("signature")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::Bundle("missing signature".to_string()))?;
    let kid = bundle
        .get("kid")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::Bundle("missing kid".to_string()))?;

    let payload = serde_json::json!({
        "trace_id": trace_id,
        "chain": chain_value,
        "exported_at": exported_at,
    });
    let computed = cid_for_value(&payload)?;
    if computed != claimed_cid {
        return Err(VerifyError::Bundle(format!(
            "bundle_cid mismatch: claimed {claimed_cid}, computed {computed}"
        )));
    }

    let key = keys
        .get(kid)
        .ok_or_else(|| VerifyError::UnknownKid(kid.to_string()))?;
    let signature = decode_signature(signature)?;
    key.verify(claimed_cid.as_bytes(), &signature)
        .map_err(|_| VerifyError::Signature)?;

    let chain: Vec<Receipt> = serde_json::from_value(chain_value.clone())
        .map_err(|e| VerifyError::Bundle(format!("chain decode: {e}")))?;
    verify_chain(&chain, keys)
}

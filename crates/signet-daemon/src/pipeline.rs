// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Exchange pipeline orchestrator.
//!
//! One `submit_exchange` call runs the full verified-exchange sequence:
//! idempotency check, payload sanitization, argument parsing with the
//! deterministic and model-backed repair tiers, schema validation,
//! transform, HEL policy evaluation, the bounded forward attempt, receipt
//! construction and sealing, the atomic storage commit, and metering.
//! Every non-success leaves no receipt and no counter increments.

use crate::billing::{BillingBuffer, MeterEvent, MeterUnit};
use crate::config::{ConfigHandle, Limits, TenantConfig};
use crate::fallback::RepairProvider;
use crate::forward::{pinned_forward, ForwardTarget};
use crate::keys::Signer;
use crate::policy::HelPolicyEngine;
use crate::storage::{month_of_ts, ExchangeCommit, StorageError, StoragePort};
use crate::telemetry::Telemetry;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use signet_core::cid::{cid_for_value, HASH_ALGO};
use signet_core::receipt::{ForwardedBlock, PolicyBlock, Receipt};
use signet_core::{invariants, jcs, repair};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("missing api key header")]
    MissingApiKey,
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("missing idempotency header")]
    MissingIdempotencyKey,
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("request body is not valid JSON: {0}")]
    MalformedBody(String),
    #[error("missing payload_type/target_type/payload")]
    MissingFields,
    #[error("trace_id must be a UUID")]
    InvalidTraceId,
    #[error("unsupported mapping {from} -> {target}")]
    UnsupportedMapping { from: String, target: String },
    #[error("{kind}: {detail}")]
    Validation { kind: &'static str, detail: String },
    #[error("fallback repair violated semantic invariants")]
    SemanticViolations { violations: Vec<String> },
    #[error("fallback quota exceeded: {used} used + {estimated} estimated > {limit} limit")]
    FuQuotaExceeded {
        used: u64,
        estimated: u64,
        limit: u64,
    },
    #[error("chain conflict")]
    ChainConflict,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExchangeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingApiKey | Self::InvalidApiKey => "auth_error",
            Self::MissingIdempotencyKey | Self::BodyTooLarge { .. } | Self::MalformedBody(_) => {
                "bad_request"
            }
            Self::MissingFields | Self::InvalidTraceId | Self::Validation { .. } => {
                "validation_error"
            }
            Self::UnsupportedMapping { .. } => "unsupported_mapping",
            Self::SemanticViolations { .. } => "semantic_violation",
            Self::FuQuotaExceeded { .. } => "quota_exceeded",
            Self::ChainConflict => "chain_conflict",
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingApiKey | Self::InvalidApiKey => 401,
            Self::MissingIdempotencyKey | Self::BodyTooLarge { .. } | Self::MalformedBody(_) => {
                400
            }
            Self::MissingFields
            | Self::InvalidTraceId
            | Self::UnsupportedMapping { .. }
            | Self::Validation { .. }
            | Self::SemanticViolations { .. } => 422,
            Self::FuQuotaExceeded { .. } => 429,
            Self::ChainConflict => 409,
            Self::Storage(_) | Self::Internal(_) => 500,
        }
    }
}

impl From<StorageError> for ExchangeError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::ChainConflict => Self::ChainConflict,
            StorageError::Backend(m) => Self::Storage(m),
        }
    }
}

impl From<signet_core::SignetError> for ExchangeError {
    fn from(e: signet_core::SignetError) -> Self {
        Self::Internal(e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeRequest {
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub payload_type: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub forward_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub body: Value,
    pub trace_id: String,
    pub idempotent_replay: bool,
}

pub struct Pipeline {
    storage: Arc<dyn StoragePort>,
    registry: Arc<signet_core::mapping::MappingRegistry>,
    signer: Arc<Signer>,
    policy: HelPolicyEngine,
    provider: Arc<dyn RepairProvider>,
    billing: BillingBuffer,
    telemetry: Telemetry,
    config: Arc<ConfigHandle>,
    limits: Limits,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn StoragePort>,
        registry: Arc<signet_core::mapping::MappingRegistry>,
        signer: Arc<Signer>,
        policy: HelPolicyEngine,
        provider: Arc<dyn RepairProvider>,
        billing: BillingBuffer,
        telemetry: Telemetry,
        config: Arc<ConfigHandle>,
        limits: Limits,
    ) -> Self {
        Self {
            storage,
            registry,
            signer,
            policy,
            provider,
            billing,
            telemetry,
            config,
            limits,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StoragePort> {
        &self.storage
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub async fn submit_exchange(
        &self,
        api_key: &str,
        idempotency_key: &str,
        raw_body: &[u8],
    ) -> Result<ExchangeOutcome, ExchangeError> {
        if api_key.is_empty() {
            return Err(ExchangeError::MissingApiKey);
        }
        if idempotency_key.is_empty() {
            return Err(ExchangeError::MissingIdempotencyKey);
        }
        // Requests pin the configuration snapshot they enter with.
        let snapshot = self.config.snapshot();
        let tenant = snapshot
            .tenant_for_key(api_key)
            .ok_or(ExchangeError::InvalidApiKey)?;

        if let Some(cached) = self.storage.get_idempotent(api_key, idempotency_key)? {
            self.telemetry.record_idempotent_hit();
            let trace_id = cached
                .get("trace_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(ExchangeOutcome {
                body: cached,
                trace_id,
                idempotent_replay: true,
            });
        }

        if raw_body.len() > self.limits.max_request_bytes {
            return Err(ExchangeError::BodyTooLarge {
                limit: self.limits.max_request_bytes,
            });
        }
        let request: ExchangeRequest = serde_json::from_slice(raw_body)
            .map_err(|e| ExchangeError::MalformedBody(e.to_string()))?;

        let (Some(payload_type), Some(target_type), Some(payload)) =
            (request.payload_type, request.target_type, request.payload)
        else {
            return Err(ExchangeError::MissingFields);
        };
        let trace_id = match request.trace_id {
            Some(provided) => {
                if Uuid::parse_str(&provided).is_err() {
                    return Err(ExchangeError::InvalidTraceId);
                }
                provided
            }
            None => Uuid::new_v4().to_string(),
        };

        let mapping = self
            .registry
            .lookup(&payload_type, &target_type)
            .map_err(|_| ExchangeError::UnsupportedMapping {
                from: payload_type.clone(),
                target: target_type.clone(),
            })?;

        let payload = project_surface(sanitize_value(payload), mapping.payload_surface());
        let args_text = payload
            .pointer("/tool_calls/0/function/arguments")
            .and_then(Value::as_str)
            .ok_or(ExchangeError::Validation {
                kind: "input",
                detail: "tool_calls[0].function.arguments missing or not a string".to_string(),
            })?;

        let (args_obj, fallback_used, fu_tokens) =
            self.parse_arguments(&tenant, mapping, args_text).await?;

        mapping
            .validate_input(&args_obj)
            .map_err(|e| ExchangeError::Validation {
                kind: "input_schema",
                detail: truncate(&e.to_string()),
            })?;
        let normalized =
            (mapping.transform)(&args_obj).map_err(|e| ExchangeError::Validation {
                kind: "transform",
                detail: truncate(&e.to_string()),
            })?;
        mapping
            .validate_output(&normalized)
            .map_err(|e| ExchangeError::Validation {
                kind: "normalized_schema",
                detail: truncate(&e.to_string()),
            })?;

        let canon = jcs::canonical_string(&normalized)?;
        let cid = cid_for_value(&normalized)?;

        // Policy and the bounded forward attempt happen before sealing so
        // the receipt hash covers the forward outcome.
        let (policy_block, forwarded) = self
            .evaluate_forward(&tenant, &snapshot.global_allowlist, &request.forward_url, &trace_id, &canon)
            .await;

        let last = self.storage.get_last(&trace_id)?;
        let (hop, prev_receipt_hash, expected_prev_hop) = match &last {
            Some(prev) => (prev.hop + 1, prev.receipt_hash.clone(), prev.hop),
            None => (1, None, 0),
        };

        let ts = now_ts();
        let month = month_of_ts(&ts);
        let mut receipt = Receipt {
            trace_id: trace_id.clone(),
            hop,
            ts,
            tenant: tenant.tenant.clone(),
            cid: cid.clone(),
            canon,
            algo: HASH_ALGO.to_string(),
            prev_receipt_hash: prev_receipt_hash.clone(),
            policy: policy_block.clone(),
            forwarded: forwarded.clone(),
            fallback_used: fallback_used.then_some(true),
            fu_tokens: (fu_tokens > 0).then_some(fu_tokens),
            semantic_violations: None,
            receipt_hash: None,
            signature: None,
            kid: None,
        };
        let seal_payload = receipt.seal_payload()?;
        let signature = self.signer.sign_b64(&seal_payload);
        receipt.seal(signature, self.signer.kid().to_string())?;

        let mut response = json!({
            "trace_id": trace_id.clone(),
            "normalized": normalized,
            "policy": serde_json::to_value(&policy_block)
                .map_err(|e| ExchangeError::Internal(e.to_string()))?,
            "receipt": {
                "ts": receipt.ts.clone(),
                "cid": cid.clone(),
                "receipt_hash": receipt.receipt_hash.clone(),
                "prev_receipt_hash": prev_receipt_hash,
                "hop": hop,
            },
        });
        if let Some(block) = &forwarded {
            response["forwarded"] = serde_json::to_value(block)
                .map_err(|e| ExchangeError::Internal(e.to_string()))?;
        }

        let commit = ExchangeCommit {
            receipt: &receipt,
            expected_prev_hop,
            api_key,
            idempotency_key,
            response_snapshot: &response,
            month: &month,
            vex_delta: 1,
            fu_delta: fu_tokens,
        };
        self.storage.append_exchange(&commit).map_err(|e| {
            if matches!(e, StorageError::ChainConflict) {
                self.telemetry.record_chain_conflict();
            }
            ExchangeError::from(e)
        })?;

        self.telemetry.record_exchange();
        self.telemetry.record_usage(1, fu_tokens);
        self.billing
            .enqueue(MeterEvent {
                tenant: tenant.tenant.clone(),
                unit: MeterUnit::Vex,
                amount: 1,
                billing_item: tenant.stripe_item_vex.clone(),
            })
            .await;
        if fu_tokens > 0 {
            self.billing
                .enqueue(MeterEvent {
                    tenant: tenant.tenant.clone(),
                    unit: MeterUnit::Fu,
                    amount: fu_tokens,
                    billing_item: tenant.stripe_item_fu.clone(),
                })
                .await;
        }

        tracing::info!(
            target: "signet.audit",
            trace_id = %trace_id,
            hop,
            tenant = %tenant.tenant,
            cid = %cid,
            policy_allowed = policy_block.allowed,
            fallback_used,
            fu_tokens,
            "exchange verified"
        );

        Ok(ExchangeOutcome {
            body: response,
            trace_id,
            idempotent_replay: false,
        })
    }

    /// Strict parse, then the deterministic repair tier, then the
    /// quota-gated model fallback. Returns the parsed arguments plus
    /// whether the model fallback ran and what it cost.
    async fn parse_arguments(
        &self,
        tenant: &TenantConfig,
        mapping: &signet_core::mapping::Mapping,
        args_text: &str,
    ) -> Result<(Value, bool, u64), ExchangeError> {
        self.telemetry.record_repair_attempt();
        if let Some(v) = repair::try_parse(args_text) {
            return Ok((v, false, 0));
        }
        if let Some(v) = repair::repair_json_text(args_text) {
            self.telemetry.record_repair_success();
            return Ok((v, false, 0));
        }

        if !tenant.fallback_enabled {
            return Err(ExchangeError::Validation {
                kind: "arguments_parse",
                detail: "arguments parse failed".to_string(),
            });
        }

        let estimated = self.provider.estimate_tokens(args_text);
        if let Some(limit) = tenant.fu_monthly_limit {
            let used = self
                .storage
                .get_monthly_usage(&tenant.tenant, &current_month())?
                .fu_tokens;
            if used.saturating_add(estimated) > limit {
                return Err(ExchangeError::FuQuotaExceeded {
                    used,
                    estimated,
                    limit,
                });
            }
        }

        let outcome = self
            .provider
            .repair(args_text, mapping.input_schema())
            .await
            .map_err(|e| ExchangeError::Validation {
                kind: "arguments_parse",
                detail: truncate(&format!("arguments parse/repair failed: {e}")),
            })?;
        let repaired = repair::try_parse(&outcome.text).ok_or(ExchangeError::Validation {
            kind: "repair_output",
            detail: "repair produced non-JSON".to_string(),
        })?;

        let violations = invariants::validate_repair(
            args_text,
            &repaired,
            mapping.required_input_fields(),
        );
        if !violations.is_empty() {
            self.telemetry.record_semantic_violation();
            // Tokens were consumed by the provider, but rejected repairs
            // are not billed.
            return Err(ExchangeError::SemanticViolations {
                violations: violations.iter().map(|v| v.to_string()).collect(),
            });
        }

        self.telemetry.record_repair_success();
        self.telemetry.record_fallback_used();
        Ok((repaired, true, outcome.tokens))
    }

    async fn evaluate_forward(
        &self,
        tenant: &TenantConfig,
        global_allowlist: &[String],
        forward_url: &Option<String>,
        trace_id: &str,
        canon: &str,
    ) -> (PolicyBlock, Option<ForwardedBlock>) {
        let Some(url) = forward_url.as_deref() else {
            return (PolicyBlock::allowed("ok"), None);
        };
        let decision = self
            .policy
            .evaluate(&tenant.allowlist, global_allowlist, url)
            .await;
        if !decision.allowed {
            self.telemetry.record_denied(&decision.reason);
            tracing::info!(
                trace_id = %trace_id,
                url,
                reason = %decision.reason,
                "forward denied by policy"
            );
            return (PolicyBlock::denied(decision.reason), None);
        }
        let (Some(host), Some(pinned)) = (decision.host.as_deref(), decision.selected_address)
        else {
            return (PolicyBlock::denied("invalid_url"), None);
        };
        let block = pinned_forward(
            ForwardTarget {
                url,
                host,
                port: decision.port,
                pinned,
                trace_id,
            },
            canon.as_bytes().to_vec(),
            &self.limits,
        )
        .await;
        match &block.error {
            Some(reason) => self.telemetry.record_forward_error(reason),
            None => self.telemetry.record_forward(&block.host),
        }
        (PolicyBlock::allowed("ok"), Some(block))
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(200).collect()
}

pub fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn current_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

/// Strip C0 control characters (keeping tab and newline) and normalize
/// CR/CRLF to LF, recursively over every string in the payload.
pub fn sanitize_value(v: Value) -> Value {
    match v {
        Value::String(s) => Value::String(sanitize_text(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, val)| (k, sanitize_value(val)))
                .collect(),
        ),
        other => other,
    }
}

fn sanitize_text(s: &str) -> String {
    let normalized = s.replace("\r\n", "\n").replace('\r', "\n");
    normalized
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || (*c as u32) >= 0x20)
        .filter(|c| (*c as u32) != 0x7f)
        .collect()
}

/// Keep only the top-level payload keys the mapping declares as its input
/// surface.
pub fn project_surface(payload: Value, surface: &[String]) -> Value {
    let Value::Object(map) = payload else {
        return payload;
    };
    let kept: Map<String, Value> = map
        .into_iter()
        .filter(|(k, _)| surface.iter().any(|s| s == k))
        .collect();
    Value::Object(kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_characters() {
        let v = json!({"a": "x\u{0000}y\r\nz", "nested": ["\u{0007}ok\r"]});
        let clean = sanitize_value(v);
        assert_eq!(clean, json!({"a": "xy\nz", "nested": ["ok\n"]}));
    }

    #[test]
    fn sanitize_keeps_tabs_and_newlines() {
        let v = json!("a\tb\nc");
        assert_eq!(sanitize_value(v), json!("a\tb\nc"));
    }

    #[test]
    fn projection_drops_undeclared_fields() {
        let payload = json!({"tool_calls": [], "debug": true, "extra": {"x": 1}});
        let projected = project_surface(payload, &["tool_calls".to_string()]);
        assert_eq!(projected, json!({"tool_calls": []}));
    }

    #[test]
    fn timestamp_shape() {
        let ts = now_ts();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
        assert_eq!(month_of_ts(&ts), current_month());
    }
}

// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the daemon integration suites.

use serde_json::{json, Value};
use signet_core::mapping::MappingRegistry;
use signet_daemon::billing::{BillingBuffer, CollectingSink};
use signet_daemon::config::{ConfigHandle, Limits, RuntimeConfig, TenantConfig};
use signet_daemon::fallback::{NullProvider, RepairProvider};
use signet_daemon::keys::Signer;
use signet_daemon::pipeline::Pipeline;
use signet_daemon::policy::{HelPolicyEngine, StaticResolver};
use signet_daemon::storage::{MemoryStore, StoragePort};
use signet_daemon::telemetry::Telemetry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const API_KEY: &str = "key-acme";
pub const TENANT: &str = "acme";

pub struct TestHarness {
    pub pipeline: Arc<Pipeline>,
    pub storage: Arc<dyn StoragePort>,
    pub telemetry: Telemetry,
    pub sink: Arc<CollectingSink>,
    pub billing_handle: JoinHandle<()>,
}

pub struct HarnessOptions {
    pub tenant: TenantConfig,
    pub global_allowlist: Vec<String>,
    pub provider: Arc<dyn RepairProvider>,
    pub resolver: StaticResolver,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            tenant: tenant_config(),
            global_allowlist: Vec::new(),
            provider: Arc::new(NullProvider),
            resolver: StaticResolver::default(),
        }
    }
}

pub fn tenant_config() -> TenantConfig {
    TenantConfig {
        tenant: TENANT.to_string(),
        allowlist: vec!["*.partner.com".to_string()],
        fallback_enabled: false,
        fu_monthly_limit: None,
        stripe_item_vex: Some("si_vex".to_string()),
        stripe_item_fu: Some("si_fu".to_string()),
    }
}

pub fn harness(options: HarnessOptions) -> TestHarness {
    let storage: Arc<dyn StoragePort> = Arc::new(MemoryStore::new());
    let telemetry = Telemetry::new();
    let sink = Arc::new(CollectingSink::default());
    let (billing, billing_handle) =
        BillingBuffer::spawn(sink.clone(), 64, Duration::from_secs(3600));

    let mut tenants = HashMap::new();
    tenants.insert(API_KEY.to_string(), Arc::new(options.tenant));
    let config = Arc::new(ConfigHandle::fixed(RuntimeConfig {
        tenants,
        global_allowlist: options.global_allowlist,
        reserved: HashMap::new(),
    }));

    let pipeline = Arc::new(Pipeline::new(
        storage.clone(),
        Arc::new(MappingRegistry::with_builtin().expect("builtin registry")),
        Arc::new(Signer::from_hex_seed(&"42".repeat(32), "key-test").expect("signer")),
        HelPolicyEngine::new(Arc::new(options.resolver)),
        options.provider,
        billing,
        telemetry.clone(),
        config,
        Limits {
            forward_timeout_secs: 2,
            ..Limits::default()
        },
    ));

    TestHarness {
        pipeline,
        storage,
        telemetry,
        sink,
        billing_handle,
    }
}

pub fn invoice_body(arguments: &str) -> Vec<u8> {
    exchange_body(arguments, None, None)
}

pub fn exchange_body(
    arguments: &str,
    trace_id: Option<&str>,
    forward_url: Option<&str>,
) -> Vec<u8> {
    let mut body = json!({
        "payload_type": "openai.tooluse.invoice.v1",
        "target_type": "invoice.iso20022.v1",
        "payload": {
            "tool_calls": [{
                "type": "function",
                "function": {
                    "name": "create_invoice",
                    "arguments": arguments,
                }
            }]
        }
    });
    if let Some(trace_id) = trace_id {
        body["trace_id"] = json!(trace_id);
    }
    if let Some(url) = forward_url {
        body["forward_url"] = json!(url);
    }
    serde_json::to_vec(&body).expect("body")
}

pub const VALID_ARGS: &str = r#"{"invoice_id":"INV-1","amount":1000,"currency":"USD"}"#;

pub fn expect_normalized(body: &Value) {
    assert_eq!(
        body["normalized"],
        json!({"invoice_id":"INV-1","amount_minor":100000,"currency":"USD"})
    );
}

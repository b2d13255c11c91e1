// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use signet_core::mapping::MappingRegistry;
use signet_daemon::billing::{BillingBuffer, LogSink};
use signet_daemon::config::{
    ConfigHandle, Limits, DEFAULT_FORWARD_TIMEOUT_SECS, DEFAULT_MAX_FORWARD_RESPONSE_BYTES,
    DEFAULT_MAX_REQUEST_BYTES,
};
use signet_daemon::fallback::{NullProvider, OpenAiRepairProvider, RepairProvider};
use signet_daemon::keys::{Signer, DEFAULT_KID};
use signet_daemon::pipeline::Pipeline;
use signet_daemon::policy::HelPolicyEngine;
use signet_daemon::server::{serve, AppState};
use signet_daemon::storage::{MemoryStore, SqliteStore, StoragePort};
use signet_daemon::telemetry::Telemetry;

#[derive(Debug, Parser)]
#[command(name = "signet-daemon")]
#[command(about = "Signet verified-exchange daemon")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8088")]
    listen: String,

    /// Storage DSN: `sqlite://<path>` for the embedded engine, `memory:`
    /// for ephemeral development runs.
    #[arg(long, default_value = "sqlite://./data/signet.db")]
    storage_dsn: String,

    /// Tenants file: api key -> tenant config plus the global allowlist.
    #[arg(long)]
    tenants: Option<PathBuf>,

    /// Reserved-capacity file: per-tenant reservations and overage tiers.
    #[arg(long)]
    reserved: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log: String,

    #[arg(long, default_value = DEFAULT_KID)]
    kid: String,

    #[arg(long, default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    max_request_bytes: usize,

    #[arg(long, default_value_t = DEFAULT_FORWARD_TIMEOUT_SECS)]
    forward_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_FORWARD_RESPONSE_BYTES)]
    max_forward_response_bytes: u64,

    /// OpenAI-compatible endpoint for the fallback repair provider.
    #[arg(long, default_value = "https://api.openai.com")]
    openai_base_url: String,

    #[arg(long, default_value = "gpt-4o-mini")]
    openai_model: String,

    #[arg(long, default_value_t = 30)]
    billing_flush_secs: u64,

    #[arg(long, default_value_t = 1024)]
    billing_buffer_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log.clone()))
        .init();

    let storage: Arc<dyn StoragePort> = if args.storage_dsn.starts_with("memory") {
        Arc::new(MemoryStore::new())
    } else if let Some(path) = args.storage_dsn.strip_prefix("sqlite://") {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Arc::new(SqliteStore::open(&path)?)
    } else {
        return Err(format!("unsupported storage dsn: {}", args.storage_dsn).into());
    };

    let config = Arc::new(ConfigHandle::load(
        args.tenants.clone(),
        args.reserved.clone(),
    )?);
    let signer = Arc::new(Signer::from_env_or_generate(args.kid.clone())?);

    let provider: Arc<dyn RepairProvider> = match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.is_empty() => Arc::new(OpenAiRepairProvider::new(
            args.openai_base_url.clone(),
            key,
            args.openai_model.clone(),
        )),
        _ => {
            tracing::warn!("no OPENAI_API_KEY set, fallback repair is unavailable");
            Arc::new(NullProvider)
        }
    };

    let (billing, billing_handle) = BillingBuffer::spawn(
        Arc::new(LogSink),
        args.billing_buffer_capacity,
        Duration::from_secs(args.billing_flush_secs),
    );

    let limits = Limits {
        max_request_bytes: args.max_request_bytes,
        max_forward_response_bytes: args.max_forward_response_bytes,
        forward_timeout_secs: args.forward_timeout_secs,
    };
    let pipeline = Arc::new(Pipeline::new(
        storage,
        Arc::new(MappingRegistry::with_builtin()?),
        signer,
        HelPolicyEngine::system(),
        provider,
        billing,
        Telemetry::new(),
        config,
        limits,
    ));

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(
        listen = %args.listen,
        storage_dsn = %args.storage_dsn,
        max_request_bytes = limits.max_request_bytes,
        forward_timeout_secs = limits.forward_timeout_secs,
        "starting signet daemon"
    );

    serve(listener, AppState { pipeline }, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    // The router (and with it the pipeline's billing handle) is gone once
    // serve returns; awaiting the flusher drains the remaining events.
    billing_handle.await?;
    Ok(())
}

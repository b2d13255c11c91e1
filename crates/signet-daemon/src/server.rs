// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface for the exchange daemon.
//!
//! Routes, headers, and status codes are part of the protocol contract:
//! `X-SIGNET-API-Key` authenticates, `X-SIGNET-Idempotency-Key` keys the
//! at-most-once guarantee, `X-SIGNET-Trace` echoes the trace, and export
//! responses carry the bundle CID and detached signature in `X-ODIN-*`
//! headers for independent verification.

use crate::pipeline::{now_ts, ExchangeError, Pipeline};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use signet_core::cid::cid_for_value;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub const API_KEY_HEADER: &str = "x-signet-api-key";
pub const IDEMPOTENCY_HEADER: &str = "x-signet-idempotency-key";
pub const TRACE_HEADER: &str = "x-signet-trace";
pub const IDEMPOTENT_HIT_HEADER: &str = "x-signet-idempotency-hit";
pub const RESPONSE_CID_HEADER: &str = "x-odin-response-cid";
pub const SIGNATURE_HEADER: &str = "x-odin-signature";
pub const KID_HEADER: &str = "x-odin-kid";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

pub fn router(state: AppState) -> Router {
    // The transport-level limit sits above the configured cap so the
    // pipeline's own size check surfaces the contractual 400 first.
    let body_limit = state
        .pipeline
        .limits()
        .max_request_bytes
        .saturating_mul(2);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/v1/exchange", post(exchange))
        .route("/v1/receipts/chain/:trace_id", get(chain))
        .route("/v1/receipts/export/:trace_id", get(export))
        .route("/v1/export/bundle", post(export_bundle))
        .route("/v1/admin/reload-reserved", post(reload_reserved))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn error_response(err: &ExchangeError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "error": err.code(),
        "detail": err.to_string(),
    });
    if let ExchangeError::SemanticViolations { violations } = err {
        body["semantic_violations"] = json!(violations);
    }
    (status, Json(body)).into_response()
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "storage": state.pipeline.storage().kind(),
        "ts": now_ts(),
    }))
}

async fn jwks(State(state): State<AppState>) -> Json<Value> {
    Json(state.pipeline.signer().jwks())
}

async fn exchange(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let api_key = header(&headers, API_KEY_HEADER);
    let idempotency_key = header(&headers, IDEMPOTENCY_HEADER);
    match state
        .pipeline
        .submit_exchange(api_key, idempotency_key, &body)
        .await
    {
        Ok(outcome) => {
            let mut response = Json(outcome.body).into_response();
            if let Ok(value) = HeaderValue::from_str(&outcome.trace_id) {
                response.headers_mut().insert(TRACE_HEADER, value);
            }
            if outcome.idempotent_replay {
                response
                    .headers_mut()
                    .insert(IDEMPOTENT_HIT_HEADER, HeaderValue::from_static("1"));
            }
            response
        }
        Err(err) => {
            tracing::info!(error = %err, code = err.code(), "exchange rejected");
            error_response(&err)
        }
    }
}

/// Resolve the caller's tenant or fail with 401. Chain and export reads
/// are tenant-scoped.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let api_key = header(headers, API_KEY_HEADER);
    if api_key.is_empty() {
        return Err(error_response(&ExchangeError::MissingApiKey));
    }
    state
        .pipeline
        .config()
        .snapshot()
        .tenant_for_key(api_key)
        .map(|t| t.tenant.clone())
        .ok_or_else(|| error_response(&ExchangeError::InvalidApiKey))
}

fn tenant_chain(
    state: &AppState,
    tenant: &str,
    trace_id: &str,
) -> Result<Vec<signet_core::receipt::Receipt>, Response> {
    match state.pipeline.storage().get_chain(trace_id) {
        Ok(chain) => Ok(chain
            .into_iter()
            .filter(|r| r.tenant == tenant)
            .collect()),
        Err(e) => Err(error_response(&ExchangeError::Storage(e.to_string()))),
    }
}

async fn chain(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let tenant = match authenticate(&state, &headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match tenant_chain(&state, &tenant, &trace_id) {
        Ok(chain) => Json(chain).into_response(),
        Err(response) => response,
    }
}

async fn export(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    export_impl(&state, &headers, &trace_id)
}

#[derive(serde::Deserialize)]
struct ExportRequest {
    trace_id: String,
}

async fn export_bundle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: ExportRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&ExchangeError::MalformedBody(e.to_string())),
    };
    export_impl(&state, &headers, &request.trace_id)
}

fn export_impl(state: &AppState, headers: &HeaderMap, trace_id: &str) -> Response {
    let tenant = match authenticate(state, headers) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    let chain = match tenant_chain(state, &tenant, trace_id) {
        Ok(chain) => chain,
        Err(response) => return response,
    };
    if chain.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "detail": "trace not found"})),
        )
            .into_response();
    }

    let chain_value = match serde_json::to_value(&chain) {
        Ok(v) => v,
        Err(e) => return error_response(&ExchangeError::Internal(e.to_string())),
    };
    let payload = json!({
        "trace_id": trace_id,
        "chain": chain_value,
        "exported_at": now_ts(),
    });
    let bundle_cid = match cid_for_value(&payload) {
        Ok(cid) => cid,
        Err(e) => return error_response(&ExchangeError::Internal(e.to_string())),
    };
    let signer = state.pipeline.signer();
    let signature = signer.sign_b64(bundle_cid.as_bytes());
    let kid = signer.kid().to_string();

    let mut bundle = payload;
    bundle["bundle_cid"] = json!(bundle_cid);
    bundle["signature"] = json!(signature);
    bundle["kid"] = json!(kid);

    let mut response = Json(bundle).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&bundle_cid) {
        headers.insert(RESPONSE_CID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&signature) {
        headers.insert(SIGNATURE_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&kid) {
        headers.insert(KID_HEADER, value);
    }
    response
}

async fn reload_reserved(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authenticate(&state, &headers) {
        return response;
    }
    match state.pipeline.config().reload() {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "reserved config reload failed");
            error_response(&ExchangeError::Internal(e.to_string()))
        }
    }
}

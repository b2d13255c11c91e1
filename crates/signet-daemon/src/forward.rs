// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pinned HTTPS forwarder.
//!
//! The TCP peer is fixed to the address the policy engine selected while
//! TLS SNI and certificate verification still use the original hostname.
//! Redirects are never followed; the response body is size-capped and
//! never surfaced to the caller.

use crate::config::Limits;
use signet_core::receipt::ForwardedBlock;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub const ERROR_TIMEOUT: &str = "timeout";
pub const ERROR_CONNECT: &str = "connect_error";
pub const ERROR_REQUEST: &str = "request_error";
pub const ERROR_RESPONSE_TOO_LARGE: &str = "response_too_large";
pub const ERROR_CLIENT_BUILD: &str = "client_build_error";

pub struct ForwardTarget<'a> {
    pub url: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub pinned: IpAddr,
    pub trace_id: &'a str,
}

/// POST the canonical payload bytes to the target, pinned to the vetted
/// address. Failures are reported in the returned block with
/// `status_code = 0`; they never abort the exchange.
pub async fn pinned_forward(
    target: ForwardTarget<'_>,
    canonical_body: Vec<u8>,
    limits: &Limits,
) -> ForwardedBlock {
    let mut block = ForwardedBlock {
        url: target.url.to_string(),
        status_code: 0,
        host: target.host.to_string(),
        pinned_ip: target.pinned.to_string(),
        response_size: 0,
        error: None,
    };

    let client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .resolve(target.host, SocketAddr::new(target.pinned, target.port))
        .timeout(Duration::from_secs(limits.forward_timeout_secs))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(host = %target.host, error = %err, "forward client build failed");
            block.error = Some(ERROR_CLIENT_BUILD.to_string());
            return block;
        }
    };

    let sent = client
        .post(target.url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header("X-SIGNET-Trace", target.trace_id)
        .body(canonical_body)
        .send()
        .await;

    let mut response = match sent {
        Ok(response) => response,
        Err(err) => {
            block.error = Some(classify(&err).to_string());
            tracing::warn!(
                host = %target.host,
                pinned = %target.pinned,
                error = %err,
                "forward request failed"
            );
            return block;
        }
    };

    block.status_code = response.status().as_u16();

    // Streamed read so an oversized body aborts at the cap instead of
    // buffering the whole response.
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                block.response_size = block.response_size.saturating_add(chunk.len() as u64);
                if block.response_size > limits.max_forward_response_bytes {
                    block.status_code = 0;
                    block.error = Some(ERROR_RESPONSE_TOO_LARGE.to_string());
                    return block;
                }
            }
            Ok(None) => break,
            Err(err) => {
                block.status_code = 0;
                block.error = Some(classify(&err).to_string());
                return block;
            }
        }
    }

    tracing::info!(
        host = %target.host,
        pinned = %target.pinned,
        status = block.status_code,
        response_size = block.response_size,
        "forward completed"
    );
    block
}

fn classify(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        ERROR_TIMEOUT
    } else if err.is_connect() {
        ERROR_CONNECT
    } else {
        ERROR_REQUEST
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn limits() -> Limits {
        Limits {
            forward_timeout_secs: 1,
            ..Limits::default()
        }
    }

    async fn local_forward(server: &MockServer, max_response_bytes: u64) -> ForwardedBlock {
        let port = server.address().port();
        let limits = Limits {
            forward_timeout_secs: 2,
            max_forward_response_bytes: max_response_bytes,
            ..Limits::default()
        };
        pinned_forward(
            ForwardTarget {
                url: &format!("http://localhost:{port}/hook"),
                host: "localhost",
                port,
                pinned: "127.0.0.1".parse().unwrap(),
                trace_id: "11111111-1111-4111-8111-111111111111",
            },
            b"{\"amount_minor\":100000}".to_vec(),
            &limits,
        )
        .await
    }

    #[tokio::test]
    async fn delivers_canonical_body_to_the_pinned_peer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(header("X-SIGNET-Trace", "11111111-1111-4111-8111-111111111111"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
            .mount(&server)
            .await;
        let block = local_forward(&server, 1024).await;
        assert_eq!(block.status_code, 200);
        assert_eq!(block.response_size, 16);
        assert!(block.error.is_none());
    }

    #[tokio::test]
    async fn response_exactly_at_the_cap_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;
        let block = local_forward(&server, 64).await;
        assert_eq!(block.status_code, 200);
        assert_eq!(block.response_size, 64);
        assert!(block.error.is_none());
    }

    #[tokio::test]
    async fn one_byte_over_the_cap_is_an_overflow_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 65]))
            .mount(&server)
            .await;
        let block = local_forward(&server, 64).await;
        assert_eq!(block.status_code, 0);
        assert_eq!(block.error.as_deref(), Some(ERROR_RESPONSE_TOO_LARGE));
    }

    #[tokio::test]
    async fn unreachable_peer_reports_error_block() {
        // TEST-NET-1 address, guaranteed unroutable; the deadline bounds it.
        let block = pinned_forward(
            ForwardTarget {
                url: "https://hooks.partner.com/receive",
                host: "hooks.partner.com",
                port: 443,
                pinned: "192.0.2.1".parse().unwrap(),
                trace_id: "11111111-1111-4111-8111-111111111111",
            },
            b"{}".to_vec(),
            &limits(),
        )
        .await;
        assert_eq!(block.status_code, 0);
        assert!(block.error.is_some());
        assert_eq!(block.pinned_ip, "192.0.2.1");
        assert_eq!(block.host, "hooks.partner.com");
    }
}

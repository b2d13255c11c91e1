// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! HEL (Host Egress List) policy engine.
//!
//! A forward target is admitted only when its host matches the tenant or
//! global allowlist and resolves to a publicly routable address. The
//! selected address is returned so the forwarder can pin its TCP peer to
//! a value this engine actually vetted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use url::{Host, Url};

pub const REASON_OK: &str = "ok";
pub const REASON_INVALID_URL: &str = "invalid_url";
pub const REASON_SCHEME_NOT_HTTPS: &str = "scheme_not_https";
pub const REASON_MISSING_HOST: &str = "missing_host";
pub const REASON_USERINFO: &str = "userinfo_not_allowed";
pub const REASON_NOT_ALLOWLISTED: &str = "host_not_allowlisted";
pub const REASON_DNS_FAILED: &str = "dns_resolution_failed";
pub const REASON_PRIVATE_IP: &str = "private_ip";

const METADATA_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub host: Option<String>,
    pub port: u16,
    pub selected_address: Option<IpAddr>,
}

impl PolicyDecision {
    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
            host: None,
            port: 0,
            selected_address: None,
        }
    }

    fn deny_host(reason: &str, host: &str) -> Self {
        Self {
            host: Some(host.to_string()),
            ..Self::deny(reason)
        }
    }
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// Fixed name table for tests and air-gapped runs.
#[derive(Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn with(mut self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.entries.insert(host.to_string(), addrs);
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        self.entries.get(host).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "host not found")
        })
    }
}

pub struct HelPolicyEngine {
    resolver: Arc<dyn HostResolver>,
}

impl HelPolicyEngine {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self { resolver }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemResolver))
    }

    /// Evaluate a forward URL against the union of the tenant and global
    /// allowlists, then resolve and select a publicly routable address.
    pub async fn evaluate(
        &self,
        tenant_allowlist: &[String],
        global_allowlist: &[String],
        raw_url: &str,
    ) -> PolicyDecision {
        let url = match Url::parse(raw_url) {
            Ok(url) => url,
            Err(_) => return PolicyDecision::deny(REASON_INVALID_URL),
        };
        if url.scheme() != "https" {
            return PolicyDecision::deny(REASON_SCHEME_NOT_HTTPS);
        }
        if !url.username().is_empty() || url.password().is_some() {
            return PolicyDecision::deny(REASON_USERINFO);
        }

        // The url crate already applied IDNA and lower-casing to domains.
        let (host, literal) = match url.host() {
            Some(Host::Domain(d)) => (d.to_ascii_lowercase(), None),
            Some(Host::Ipv4(ip)) => (ip.to_string(), Some(IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => (ip.to_string(), Some(IpAddr::V6(ip))),
            None => return PolicyDecision::deny(REASON_MISSING_HOST),
        };
        let port = url.port().unwrap_or(443);

        let allowed = tenant_allowlist
            .iter()
            .chain(global_allowlist.iter())
            .any(|entry| host_matches(entry, &host));
        if !allowed {
            return PolicyDecision::deny_host(REASON_NOT_ALLOWLISTED, &host);
        }

        let candidates = match literal {
            Some(ip) => vec![ip],
            None => match self.resolver.resolve(&host, port).await {
                Ok(addrs) if !addrs.is_empty() => addrs,
                _ => return PolicyDecision::deny_host(REASON_DNS_FAILED, &host),
            },
        };

        let Some(selected) = candidates.iter().copied().find(is_public_ip) else {
            return PolicyDecision::deny_host(REASON_PRIVATE_IP, &host);
        };

        PolicyDecision {
            allowed: true,
            reason: REASON_OK.to_string(),
            host: Some(host),
            port,
            selected_address: Some(selected),
        }
    }
}

/// Allowlist matching: exact entries match exactly; `*.example.com`
/// matches exactly one extra label under `example.com`, never the apex.
pub fn host_matches(entry: &str, host: &str) -> bool {
    let entry = entry.to_ascii_lowercase();
    if let Some(suffix) = entry.strip_prefix("*.") {
        match host.strip_suffix(suffix) {
            Some(prefix) => {
                let Some(label) = prefix.strip_suffix('.') else {
                    return false;
                };
                !label.is_empty() && !label.contains('.')
            }
            None => false,
        }
    } else {
        entry == host
    }
}

/// Publicly routable check for the selected forward peer: loopback,
/// RFC 1918 / unique-local, link-local, multicast, broadcast, unspecified,
/// carrier-grade NAT, and the cloud instance-metadata address are all
/// rejected.
pub fn is_public_ip(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_public_v4(*v4),
        IpAddr::V6(v6) => is_public_v6(*v6),
    }
}

fn is_public_v4(v4: Ipv4Addr) -> bool {
    let octets = v4.octets();
    let cgnat = octets[0] == 100 && (64..=127).contains(&octets[1]);
    !(v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_multicast()
        || v4.is_broadcast()
        || v4.is_unspecified()
        || cgnat
        || v4 == METADATA_V4)
}

fn is_public_v6(v6: Ipv6Addr) -> bool {
    if let Some(mapped) = v6.to_ipv4_mapped() {
        return is_public_v4(mapped);
    }
    let segments = v6.segments();
    let unique_local = (segments[0] & 0xfe00) == 0xfc00;
    let link_local = (segments[0] & 0xffc0) == 0xfe80;
    !(v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() || unique_local || link_local)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(resolver: StaticResolver) -> HelPolicyEngine {
        HelPolicyEngine::new(Arc::new(resolver))
    }

    fn public() -> IpAddr {
        "93.184.216.34".parse().unwrap()
    }

    #[tokio::test]
    async fn exact_allowlist_entry_admits_public_host() {
        let eng = engine(StaticResolver::default().with("hooks.partner.com", vec![public()]));
        let decision = eng
            .evaluate(
                &["hooks.partner.com".to_string()],
                &[],
                "https://hooks.partner.com/receive",
            )
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.selected_address, Some(public()));
        assert_eq!(decision.port, 443);
    }

    #[tokio::test]
    async fn wildcard_matches_one_label_only() {
        assert!(host_matches("*.partner.com", "a.partner.com"));
        assert!(!host_matches("*.partner.com", "partner.com"));
        assert!(!host_matches("*.partner.com", "a.b.partner.com"));
        assert!(!host_matches("*.partner.com", "evilpartner.com"));
    }

    #[tokio::test]
    async fn unlisted_host_is_denied_without_resolution() {
        // No resolver entry: a DNS attempt would fail loudly, but the
        // allowlist check must short-circuit first.
        let eng = engine(StaticResolver::default());
        let decision = eng
            .evaluate(
                &["*.partner.com".to_string()],
                &[],
                "https://attacker.example.org/hook",
            )
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, REASON_NOT_ALLOWLISTED);
    }

    #[tokio::test]
    async fn private_resolution_is_denied() {
        let eng = engine(
            StaticResolver::default()
                .with("internal.partner.com", vec!["10.0.0.5".parse().unwrap()]),
        );
        let decision = eng
            .evaluate(
                &["*.partner.com".to_string()],
                &[],
                "https://internal.partner.com",
            )
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, REASON_PRIVATE_IP);
    }

    #[tokio::test]
    async fn first_public_address_is_selected() {
        let eng = engine(StaticResolver::default().with(
            "mixed.partner.com",
            vec!["10.0.0.5".parse().unwrap(), public()],
        ));
        let decision = eng
            .evaluate(
                &["*.partner.com".to_string()],
                &[],
                "https://mixed.partner.com:8443/x",
            )
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.selected_address, Some(public()));
        assert_eq!(decision.port, 8443);
    }

    #[tokio::test]
    async fn non_https_and_userinfo_are_denied() {
        let eng = engine(StaticResolver::default());
        let d = eng
            .evaluate(&[], &[], "http://hooks.partner.com/x")
            .await;
        assert_eq!(d.reason, REASON_SCHEME_NOT_HTTPS);
        let d = eng
            .evaluate(
                &["hooks.partner.com".to_string()],
                &[],
                "https://evil@hooks.partner.com/x",
            )
            .await;
        assert_eq!(d.reason, REASON_USERINFO);
    }

    #[tokio::test]
    async fn global_allowlist_unions_with_tenant() {
        let eng = engine(StaticResolver::default().with("hooks.example.net", vec![public()]));
        let decision = eng
            .evaluate(
                &[],
                &["hooks.example.net".to_string()],
                "https://hooks.example.net/hook",
            )
            .await;
        assert!(decision.allowed);
    }

    #[test]
    fn public_ip_ranges() {
        let private: Vec<IpAddr> = vec![
            "127.0.0.1".parse().unwrap(),
            "10.1.2.3".parse().unwrap(),
            "172.16.0.9".parse().unwrap(),
            "192.168.1.1".parse().unwrap(),
            "169.254.169.254".parse().unwrap(),
            "100.64.0.1".parse().unwrap(),
            "224.0.0.1".parse().unwrap(),
            "255.255.255.255".parse().unwrap(),
            "0.0.0.0".parse().unwrap(),
            "::1".parse().unwrap(),
            "fc00::1".parse().unwrap(),
            "fe80::1".parse().unwrap(),
            "::ffff:10.0.0.1".parse().unwrap(),
        ];
        for addr in private {
            assert!(!is_public_ip(&addr), "{addr} must not be public");
        }
        assert!(is_public_ip(&public()));
        assert!(is_public_ip(&"2606:2800:220:1:248:1893:25c8:1946".parse().unwrap()));
    }
}

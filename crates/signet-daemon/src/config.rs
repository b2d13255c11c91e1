use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10_000_000;
pub const DEFAULT_MAX_FORWARD_RESPONSE_BYTES: u64 = 1_048_576;
pub const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("tenant {tenant}: overage tiers must be strictly increasing by threshold")]
    TierOrdering { tenant: String },
}

/// Per-tenant configuration keyed by API key in the tenants file.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    pub tenant: String,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub fallback_enabled: bool,
    #[serde(default)]
    pub fu_monthly_limit: Option<u64>,
    #[serde(default)]
    pub stripe_item_vex: Option<String>,
    #[serde(default)]
    pub stripe_item_fu: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct TenantsFile {
    #[serde(default)]
    api_keys: HashMap<String, TenantConfig>,
    #[serde(default)]
    global_allowlist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverageTier {
    pub threshold: u64,
    pub price_per_unit: Decimal,
    #[serde(default)]
    pub stripe_item: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReservedCapacity {
    #[serde(default)]
    pub vex_reserved: u64,
    #[serde(default)]
    pub fu_reserved: u64,
    #[serde(default)]
    pub vex_overage_tiers: Vec<OverageTier>,
    #[serde(default)]
    pub fu_overage_tiers: Vec<OverageTier>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ReservedFile {
    #[serde(default)]
    tenants: HashMap<String, ReservedCapacity>,
}

/// Immutable configuration snapshot. Requests pin the snapshot they enter
/// with; reloads install a fresh one without disturbing in-flight work.
#[derive(Debug, Default)]
pub struct RuntimeConfig {
    pub tenants: HashMap<String, Arc<TenantConfig>>,
    pub global_allowlist: Vec<String>,
    pub reserved: HashMap<String, ReservedCapacity>,
}

impl RuntimeConfig {
    pub fn tenant_for_key(&self, api_key: &str) -> Option<Arc<TenantConfig>> {
        self.tenants.get(api_key).cloned()
    }
}

/// Reloadable handle over the tenants and reserved-capacity files.
pub struct ConfigHandle {
    tenants_path: Option<PathBuf>,
    reserved_path: Option<PathBuf>,
    current: RwLock<Arc<RuntimeConfig>>,
}

impl ConfigHandle {
    pub fn load(
        tenants_path: Option<PathBuf>,
        reserved_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let snapshot = build_snapshot(tenants_path.as_deref(), reserved_path.as_deref())?;
        Ok(Self {
            tenants_path,
            reserved_path,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Handle pinned to a fixed in-memory snapshot; reload is a no-op.
    pub fn fixed(snapshot: RuntimeConfig) -> Self {
        Self {
            tenants_path: None,
            reserved_path: None,
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        self.current.read().clone()
    }

    /// Rebuild the snapshot from the configured files and swap it in.
    /// Handles without any backing file keep their snapshot.
    pub fn reload(&self) -> Result<(), ConfigError> {
        if self.tenants_path.is_none() && self.reserved_path.is_none() {
            return Ok(());
        }
        let snapshot =
            build_snapshot(self.tenants_path.as_deref(), self.reserved_path.as_deref())?;
        *self.current.write() = Arc::new(snapshot);
        tracing::info!("configuration reloaded");
        Ok(())
    }
}

fn build_snapshot(
    tenants_path: Option<&Path>,
    reserved_path: Option<&Path>,
) -> Result<RuntimeConfig, ConfigError> {
    let tenants_file = match tenants_path {
        Some(path) => read_json::<TenantsFile>(path)?,
        None => TenantsFile::default(),
    };
    let reserved_file = match reserved_path {
        Some(path) => read_json::<ReservedFile>(path)?,
        None => ReservedFile::default(),
    };
    for (tenant, capacity) in &reserved_file.tenants {
        validate_tiers(tenant, &capacity.vex_overage_tiers)?;
        validate_tiers(tenant, &capacity.fu_overage_tiers)?;
    }
    Ok(RuntimeConfig {
        tenants: tenants_file
            .api_keys
            .into_iter()
            .map(|(key, cfg)| (key, Arc::new(cfg)))
            .collect(),
        global_allowlist: tenants_file.global_allowlist,
        reserved: reserved_file.tenants,
    })
}

fn validate_tiers(tenant: &str, tiers: &[OverageTier]) -> Result<(), ConfigError> {
    for pair in tiers.windows(2) {
        if pair[1].threshold <= pair[0].threshold {
            return Err(ConfigError::TierOrdering {
                tenant: tenant.to_string(),
            });
        }
    }
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Request-path limits fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_request_bytes: usize,
    pub max_forward_response_bytes: u64,
    pub forward_timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_forward_response_bytes: DEFAULT_MAX_FORWARD_RESPONSE_BYTES,
            forward_timeout_secs: DEFAULT_FORWARD_TIMEOUT_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn tenants_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "tenants.json",
            r#"{
                "api_keys": {
                    "key-acme": {
                        "tenant": "acme",
                        "allowlist": ["*.partner.com"],
                        "fallback_enabled": true,
                        "fu_monthly_limit": 10000,
                        "stripe_item_vex": "si_vex"
                    }
                },
                "global_allowlist": ["hooks.example.net"]
            }"#,
        );
        let handle = ConfigHandle::load(Some(path), None).unwrap();
        let snapshot = handle.snapshot();
        let tenant = snapshot.tenant_for_key("key-acme").unwrap();
        assert_eq!(tenant.tenant, "acme");
        assert!(tenant.fallback_enabled);
        assert_eq!(tenant.fu_monthly_limit, Some(10000));
        assert_eq!(snapshot.global_allowlist, vec!["hooks.example.net"]);
        assert!(snapshot.tenant_for_key("unknown").is_none());
    }

    #[test]
    fn reload_swaps_the_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "tenants.json",
            r#"{"api_keys": {"k1": {"tenant": "one"}}}"#,
        );
        let handle = ConfigHandle::load(Some(path.clone()), None).unwrap();
        let before = handle.snapshot();
        std::fs::write(&path, r#"{"api_keys": {"k2": {"tenant": "two"}}}"#).unwrap();
        handle.reload().unwrap();
        let after = handle.snapshot();
        // The earlier snapshot is unchanged for requests that pinned it.
        assert!(before.tenant_for_key("k1").is_some());
        assert!(after.tenant_for_key("k1").is_none());
        assert!(after.tenant_for_key("k2").is_some());
    }

    #[test]
    fn non_increasing_tiers_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "reserved.json",
            r#"{"tenants": {"acme": {
                "vex_reserved": 100,
                "vex_overage_tiers": [
                    {"threshold": 0, "price_per_unit": "0.005"},
                    {"threshold": 0, "price_per_unit": "0.004"}
                ]
            }}}"#,
        );
        assert!(matches!(
            ConfigHandle::load(None, Some(path)),
            Err(ConfigError::TierOrdering { .. })
        ));
    }
}

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use serde_json::{json, Value};

pub const SIGNING_KEY_ENV: &str = "SIGNET_SIGNING_KEY_HEX";
pub const DEFAULT_KID: &str = "signet-dev-1";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("signing key must be 64 hex characters (32 bytes)")]
    InvalidSeed,
}

/// Active Ed25519 signer plus every public key a verifier may still
/// encounter. Rotation keeps prior verifying keys published under their
/// original kids.
pub struct Signer {
    key: SigningKey,
    kid: String,
    prior: Vec<(String, VerifyingKey)>,
}

impl Signer {
    pub fn from_hex_seed(seed_hex: &str, kid: impl Into<String>) -> Result<Self, KeyError> {
        let bytes = hex::decode(seed_hex.trim()).map_err(|_| KeyError::InvalidSeed)?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidSeed)?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
            kid: kid.into(),
            prior: Vec::new(),
        })
    }

    /// Fresh random key for development; receipts signed with it only
    /// verify against the JWKS served by this process instance.
    pub fn generate(kid: impl Into<String>) -> Self {
        let seed: [u8; 32] = rand::random();
        Self {
            key: SigningKey::from_bytes(&seed),
            kid: kid.into(),
            prior: Vec::new(),
        }
    }

    pub fn from_env_or_generate(kid: impl Into<String>) -> Result<Self, KeyError> {
        match std::env::var(SIGNING_KEY_ENV) {
            Ok(seed) => Self::from_hex_seed(&seed, kid),
            Err(_) => {
                let signer = Self::generate(kid);
                tracing::warn!(
                    kid = %signer.kid,
                    "no {SIGNING_KEY_ENV} set, generated an ephemeral signing key"
                );
                Ok(signer)
            }
        }
    }

    /// Install a new active key, keeping the previous one published.
    pub fn rotate(&mut self, key: SigningKey, kid: impl Into<String>) {
        let old_kid = std::mem::replace(&mut self.kid, kid.into());
        let old_key = std::mem::replace(&mut self.key, key);
        self.prior.push((old_kid, old_key.verifying_key()));
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Detached signature over raw bytes, standard base64.
    pub fn sign_b64(&self, payload: &[u8]) -> String {
        STANDARD.encode(self.key.sign(payload).to_bytes())
    }

    /// JWKS document advertising the active key and all prior rotations.
    pub fn jwks(&self) -> Value {
        let mut keys: Vec<Value> = self
            .prior
            .iter()
            .map(|(kid, vk)| jwk(kid, vk))
            .collect();
        keys.push(jwk(&self.kid, &self.key.verifying_key()));
        json!({ "keys": keys })
    }
}

fn jwk(kid: &str, vk: &VerifyingKey) -> Value {
    json!({
        "kty": "OKP",
        "crv": "Ed25519",
        "x": URL_SAFE_NO_PAD.encode(vk.to_bytes()),
        "use": "sig",
        "alg": "EdDSA",
        "kid": kid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn hex_seed_round_trips() {
        let signer = Signer::from_hex_seed(&"11".repeat(32), "key-1").unwrap();
        let sig = signer.sign_b64(b"payload");
        let raw = STANDARD.decode(sig).unwrap();
        let sig = ed25519_dalek::Signature::from_bytes(&raw.try_into().unwrap());
        signer.verifying_key().verify(b"payload", &sig).unwrap();
    }

    #[test]
    fn invalid_seed_is_rejected() {
        assert!(Signer::from_hex_seed("abcd", "key-1").is_err());
        assert!(Signer::from_hex_seed(&"zz".repeat(32), "key-1").is_err());
    }

    #[test]
    fn jwks_advertises_active_kid() {
        let signer = Signer::generate("key-live");
        let jwks = signer.jwks();
        let kids: Vec<&str> = jwks["keys"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|k| k["kid"].as_str())
            .collect();
        assert_eq!(kids, vec!["key-live"]);
    }

    #[test]
    fn rotation_keeps_prior_keys_published() {
        let mut signer = Signer::from_hex_seed(&"22".repeat(32), "key-1").unwrap();
        let next = SigningKey::from_bytes(&[9u8; 32]);
        signer.rotate(next, "key-2");
        let jwks = signer.jwks();
        let kids: Vec<&str> = jwks["keys"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|k| k["kid"].as_str())
            .collect();
        assert!(kids.contains(&"key-1"));
        assert!(kids.contains(&"key-2"));
        assert_eq!(signer.kid(), "key-2");
    }
}

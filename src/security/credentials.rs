//! API-key credentials and per-request signature checks.
//!
//! [`CredentialVerifier`] is the seam to whichever subsystem owns API keys.
//! [`ApiKeyRegistry`] is the in-process implementation fed from config.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::principal::{Principal, Role};
use super::request_signer::{sha256_hex, verify_signature, SignedRequest};
use super::token_service::{Clock, SystemClock};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("Invalid API Key or Signature")]
    Rejected,
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Resolves the owner of `api_key` if `signature` is valid for the request.
    async fn validate_api_key(
        &self,
        api_key: &str,
        signature: &str,
        timestamp: &str,
        request: &SignedRequest,
    ) -> Result<Principal, CredentialError>;

    /// Checks a request signature made with one of `user_id`'s credentials.
    async fn validate_signature_for_jwt(
        &self,
        user_id: &str,
        signature: &str,
        timestamp: &str,
        request: &SignedRequest,
    ) -> Result<(), CredentialError>;
}

/// One API key as it appears in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    pub api_key: String,
    pub secret: String,
    pub user_id: String,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_role() -> Role {
    Role::Merchant
}

fn default_true() -> bool {
    true
}

#[derive(Clone)]
struct ApiKeyRecord {
    secret: String,
    active: bool,
    owner: Principal,
}

/// API keys indexed by the SHA-256 fingerprint of the key.
#[derive(Clone)]
pub struct ApiKeyRegistry {
    by_fingerprint: HashMap<String, ApiKeyRecord>,
    clock: Arc<dyn Clock>,
    max_skew_secs: i64,
}

impl ApiKeyRegistry {
    pub fn new(max_skew_secs: i64) -> Self {
        Self::with_clock(max_skew_secs, Arc::new(SystemClock))
    }

    pub fn with_clock(max_skew_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            by_fingerprint: HashMap::new(),
            clock,
            max_skew_secs,
        }
    }

    pub fn from_config(keys: &[ApiKeyConfig], max_skew_secs: i64) -> Self {
        let mut registry = Self::new(max_skew_secs);
        for k in keys {
            registry.insert(k.clone());
        }
        registry
    }

    pub fn insert(&mut self, key: ApiKeyConfig) {
        self.by_fingerprint.insert(
            fingerprint(&key.api_key),
            ApiKeyRecord {
                secret: key.secret,
                active: key.active,
                owner: Principal::new(key.user_id, key.email, key.role),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}

/// Stable identifier for an API key that is safe to log.
pub fn fingerprint(api_key: &str) -> String {
    sha256_hex(api_key.as_bytes())
}

#[async_trait]
impl CredentialVerifier for ApiKeyRegistry {
    async fn validate_api_key(
        &self,
        api_key: &str,
        signature: &str,
        timestamp: &str,
        request: &SignedRequest,
    ) -> Result<Principal, CredentialError> {
        let fp = fingerprint(api_key);
        let record = match self.by_fingerprint.get(&fp) {
            Some(r) if r.active => r,
            _ => {
                debug!(key_fp = &fp[..12], "unknown or inactive api key");
                return Err(CredentialError::Rejected);
            }
        };
        verify_signature(
            &record.secret,
            signature,
            timestamp,
            request,
            self.clock.now(),
            self.max_skew_secs,
        )
        .map_err(|e| {
            debug!(key_fp = &fp[..12], reason = %e, "api key signature rejected");
            CredentialError::Rejected
        })?;
        Ok(record.owner.clone())
    }

    async fn validate_signature_for_jwt(
        &self,
        user_id: &str,
        signature: &str,
        timestamp: &str,
        request: &SignedRequest,
    ) -> Result<(), CredentialError> {
        let now = self.clock.now();
        let verified = self
            .by_fingerprint
            .values()
            .filter(|r| r.active && r.owner.user_id == user_id)
            .any(|r| {
                verify_signature(&r.secret, signature, timestamp, request, now, self.max_skew_secs)
                    .is_ok()
            });
        if verified {
            Ok(())
        } else {
            debug!(user_id, "no active credential verified the signature");
            Err(CredentialError::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::request_signer::compute_signature_hex;
    use crate::security::token_service::FixedClock;

    const NOW: i64 = 1_700_000_000;

    fn registry() -> ApiKeyRegistry {
        let mut r = ApiKeyRegistry::with_clock(300, Arc::new(FixedClock::new(NOW)));
        r.insert(ApiKeyConfig {
            api_key: "pk_live_merchant".into(),
            secret: "merchant-secret".into(),
            user_id: "m-1".into(),
            email: "shop@example.com".into(),
            role: Role::Merchant,
            active: true,
        });
        r.insert(ApiKeyConfig {
            api_key: "pk_live_revoked".into(),
            secret: "revoked-secret".into(),
            user_id: "m-2".into(),
            email: "old@example.com".into(),
            role: Role::Merchant,
            active: false,
        });
        r
    }

    fn signed(secret: &str, req: &SignedRequest) -> (String, String) {
        let ts = NOW.to_string();
        let sig = compute_signature_hex(secret, &req.string_to_sign(&ts)).unwrap();
        (ts, sig)
    }

    #[tokio::test]
    async fn test_api_key_resolves_owner() {
        let reg = registry();
        let req = SignedRequest::new("POST", "/api/v1/payments", br#"{"amount":1}"#);
        let (ts, sig) = signed("merchant-secret", &req);
        let principal = reg
            .validate_api_key("pk_live_merchant", &sig, &ts, &req)
            .await
            .unwrap();
        assert_eq!(principal.user_id, "m-1");
        assert_eq!(principal.role, Role::Merchant);
    }

    #[tokio::test]
    async fn test_api_key_failures_are_indistinguishable() {
        let reg = registry();
        let req = SignedRequest::new("POST", "/api/v1/payments", b"");
        let (ts, good) = signed("merchant-secret", &req);
        let (_, revoked_sig) = signed("revoked-secret", &req);

        let cases = [
            ("pk_live_unknown", good.as_str(), ts.clone()),
            ("pk_live_merchant", "deadbeef", ts.clone()),
            ("pk_live_revoked", revoked_sig.as_str(), ts.clone()),
            ("pk_live_merchant", good.as_str(), (NOW - 3600).to_string()),
        ];
        for (key, sig, ts) in cases {
            let err = reg.validate_api_key(key, sig, &ts, &req).await.unwrap_err();
            assert_eq!(err, CredentialError::Rejected);
            assert_eq!(err.to_string(), "Invalid API Key or Signature");
        }
    }

    #[tokio::test]
    async fn test_signature_for_jwt_uses_owner_credentials() {
        let reg = registry();
        let req = SignedRequest::new("DELETE", "/api/v1/payments/9", b"");
        let (ts, sig) = signed("merchant-secret", &req);
        assert!(reg.validate_signature_for_jwt("m-1", &sig, &ts, &req).await.is_ok());
        assert!(reg.validate_signature_for_jwt("m-9", &sig, &ts, &req).await.is_err());

        let (ts, sig) = signed("revoked-secret", &req);
        assert!(reg.validate_signature_for_jwt("m-2", &sig, &ts, &req).await.is_err());
    }

    #[test]
    fn test_config_defaults() {
        let cfg: ApiKeyConfig = serde_json::from_str(
            r#"{"api_key":"k","secret":"s","user_id":"u","email":"e@x.io"}"#,
        )
        .unwrap();
        assert!(cfg.active);
        assert_eq!(cfg.role, Role::Merchant);
        assert_eq!(ApiKeyRegistry::from_config(&[cfg], 300).len(), 1);
    }
}

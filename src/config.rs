use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::security::credentials::ApiKeyConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: u64,
    /// 64 hex chars (AES-256 key)
    #[serde(default)]
    pub session_encryption_key: String,
    /// Absent or empty keeps legacy (bearer-accepting) mode.
    #[serde(default)]
    pub internal_proxy_secret: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_timeout_ms")]
    pub cache_timeout_ms: u64,
    #[serde(default = "default_max_skew")]
    pub signature_max_skew_secs: i64,
    #[serde(default = "default_lock_ttl")]
    pub idempotency_lock_ttl_secs: u64,
    #[serde(default = "default_retention")]
    pub idempotency_retention_secs: u64,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

fn default_access_ttl() -> u64 {
    900
}
fn default_refresh_ttl() -> u64 {
    7 * 24 * 3600
}
fn default_cache_timeout_ms() -> u64 {
    500
}
fn default_max_skew() -> i64 {
    300
}
fn default_lock_ttl() -> u64 {
    30
}
fn default_retention() -> u64 {
    24 * 3600
}
fn default_session_ttl() -> u64 {
    24 * 3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
            session_encryption_key: String::new(),
            internal_proxy_secret: None,
            redis_url: None,
            cache_timeout_ms: default_cache_timeout_ms(),
            signature_max_skew_secs: default_max_skew(),
            idempotency_lock_ttl_secs: default_lock_ttl(),
            idempotency_retention_secs: default_retention(),
            session_ttl_secs: default_session_ttl(),
            api_keys: Vec::new(),
        }
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_opt(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("invalid value for {name}")),
        None => Ok(None),
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing config JSON")?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// File values (when the file exists) overlaid by environment variables.
    pub fn load(path: &str) -> Result<Self> {
        let cfg = if Path::new(path).is_file() {
            let mut cfg = Self::from_file(path)?;
            cfg.apply_env()?;
            cfg
        } else {
            Self::from_env()?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_opt("JWT_SECRET") {
            self.jwt_secret = v;
        }
        if let Some(v) = env_parse("ACCESS_TOKEN_TTL_SECS")? {
            self.access_token_ttl_secs = v;
        }
        if let Some(v) = env_parse("REFRESH_TOKEN_TTL_SECS")? {
            self.refresh_token_ttl_secs = v;
        }
        if let Some(v) = env_opt("SESSION_ENCRYPTION_KEY") {
            self.session_encryption_key = v;
        }
        if let Some(v) = env_opt("INTERNAL_PROXY_SECRET") {
            self.internal_proxy_secret = Some(v);
        }
        if let Some(v) = env_opt("REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some(v) = env_parse("CACHE_TIMEOUT_MS")? {
            self.cache_timeout_ms = v;
        }
        if let Some(v) = env_parse("SIGNATURE_MAX_SKEW_SECS")? {
            self.signature_max_skew_secs = v;
        }
        if let Some(v) = env_parse("IDEMPOTENCY_LOCK_TTL_SECS")? {
            self.idempotency_lock_ttl_secs = v;
        }
        if let Some(v) = env_parse("IDEMPOTENCY_RETENTION_SECS")? {
            self.idempotency_retention_secs = v;
        }
        if let Some(v) = env_parse("SESSION_TTL_SECS")? {
            self.session_ttl_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.is_empty() {
            bail!("JWT_SECRET must be set");
        }
        match hex::decode(self.session_encryption_key.trim()) {
            Ok(k) if k.len() == 32 => {}
            _ => bail!("SESSION_ENCRYPTION_KEY must be 64 hex characters"),
        }
        if self.access_token_ttl_secs == 0
            || self.refresh_token_ttl_secs == 0
            || self.idempotency_lock_ttl_secs == 0
            || self.idempotency_retention_secs == 0
            || self.session_ttl_secs == 0
        {
            bail!("TTL values must be greater than zero");
        }
        if self.access_token_ttl_secs >= self.refresh_token_ttl_secs {
            bail!("access token TTL must be shorter than refresh token TTL");
        }
        Ok(())
    }

    /// Strict session mode: a non-empty proxy secret is configured.
    pub fn strict_session_mode(&self) -> bool {
        self.internal_proxy_secret
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }

    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_token_ttl_secs)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn idempotency_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_lock_ttl_secs)
    }

    pub fn idempotency_retention(&self) -> Duration {
        Duration::from_secs(self.idempotency_retention_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_config_parsing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "jwt_secret": "file-secret",
                "session_encryption_key": "{KEY}",
                "internal_proxy_secret": "proxy",
                "access_token_ttl_secs": 60,
                "api_keys": [
                    {{"api_key": "pk_1", "secret": "s", "user_id": "m-1", "email": "m@x.io", "role": "merchant"}}
                ]
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.jwt_secret, "file-secret");
        assert_eq!(config.access_token_ttl_secs, 60);
        assert_eq!(config.refresh_token_ttl_secs, 7 * 24 * 3600);
        assert_eq!(config.idempotency_lock_ttl_secs, 30);
        assert_eq!(config.idempotency_retention_secs, 86400);
        assert_eq!(config.api_keys.len(), 1);
        assert!(config.strict_session_mode());
        assert!(config.validate().is_ok());
    }

    // only test in the crate that touches the process environment
    #[test]
    fn test_load_without_file_uses_env() {
        std::env::set_var("JWT_SECRET", "env-secret");
        std::env::set_var("SESSION_ENCRYPTION_KEY", KEY);
        std::env::set_var("SESSION_TTL_SECS", "120");

        let config = Config::load("/nonexistent/path/config.json").unwrap();
        assert_eq!(config.jwt_secret, "env-secret");
        assert_eq!(config.session_ttl(), Duration::from_secs(120));
        assert_eq!(config.idempotency_lock_ttl_secs, 30);

        std::env::set_var("SESSION_TTL_SECS", "soon");
        assert!(Config::from_env().is_err());

        for name in ["JWT_SECRET", "SESSION_ENCRYPTION_KEY", "SESSION_TTL_SECS"] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_config_missing_file() {
        let result = Config::from_file("/nonexistent/path/config.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();
        assert!(Config::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = Config {
            jwt_secret: "s".into(),
            session_encryption_key: KEY.into(),
            ..Config::default()
        };
        assert!(base.validate().is_ok());

        let no_secret = Config {
            jwt_secret: String::new(),
            ..base.clone()
        };
        assert!(no_secret.validate().is_err());

        let short_key = Config {
            session_encryption_key: "abcd".into(),
            ..base.clone()
        };
        assert!(short_key.validate().is_err());

        let zero_lock = Config {
            idempotency_lock_ttl_secs: 0,
            ..base.clone()
        };
        assert!(zero_lock.validate().is_err());

        let inverted = Config {
            access_token_ttl_secs: 1000,
            refresh_token_ttl_secs: 10,
            ..base
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_empty_proxy_secret_is_legacy_mode() {
        let cfg = Config {
            internal_proxy_secret: Some(String::new()),
            ..Config::default()
        };
        assert!(!cfg.strict_session_mode());
        assert!(!Config::default().strict_session_mode());
    }
}

//! Process configuration loaded from `REVOCATION_*` environment variables.

use std::time::Duration;
use thiserror::Error;

use crate::engine::DEFAULT_IDENTITY_CLAIM;
use crate::refresh::SyncConfig;

pub const ENV_CONSUL_URL: &str = "REVOCATION_CONSUL_URL";
pub const ENV_CONSUL_TOKEN: &str = "REVOCATION_CONSUL_TOKEN";
pub const ENV_KEY_PREFIX: &str = "REVOCATION_KEY_PREFIX";
pub const ENV_IDENTITY_CLAIM: &str = "REVOCATION_IDENTITY_CLAIM";
pub const ENV_WATCH_TIMEOUT_MS: &str = "REVOCATION_WATCH_TIMEOUT_MS";
pub const ENV_STALENESS_CEILING_MS: &str = "REVOCATION_STALENESS_CEILING_MS";
pub const ENV_BACKOFF_INITIAL_MS: &str = "REVOCATION_BACKOFF_INITIAL_MS";
pub const ENV_BACKOFF_MAX_MS: &str = "REVOCATION_BACKOFF_MAX_MS";
pub const ENV_RESYNC_AFTER_FAILURES: &str = "REVOCATION_RESYNC_AFTER_FAILURES";
pub const ENV_STARTUP_RETRIES: &str = "REVOCATION_STARTUP_RETRIES";

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}: cannot parse '{value}' as a number")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("watch timeout ({watch_ms} ms) must be shorter than the staleness ceiling ({ceiling_ms} ms)")]
    WatchExceedsCeiling { watch_ms: u128, ceiling_ms: u128 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Everything the bridge needs to connect, sync and evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Consul agent base URL
    pub consul_url: String,
    /// Optional Consul ACL token
    pub consul_token: Option<String>,
    /// KV prefix holding the rule tree
    pub key_prefix: String,
    /// Claim naming the token's principal
    pub identity_claim: String,
    pub sync: SyncConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            consul_url: "http://consul:8500".to_string(),
            consul_token: None,
            key_prefix: "microfleet/ms-users/revocation-rules".to_string(),
            identity_claim: DEFAULT_IDENTITY_CLAIM.to_string(),
            sync: SyncConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = BridgeConfig::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = var(ENV_CONSUL_URL) {
            config.consul_url = url;
        }
        config.consul_token = var(ENV_CONSUL_TOKEN);
        if let Some(prefix) = var(ENV_KEY_PREFIX) {
            config.key_prefix = prefix;
        }
        if let Some(claim) = var(ENV_IDENTITY_CLAIM) {
            config.identity_claim = claim;
        }

        if let Some(ms) = parse_number(ENV_WATCH_TIMEOUT_MS, var(ENV_WATCH_TIMEOUT_MS))? {
            config.sync.watch_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(ENV_STALENESS_CEILING_MS, var(ENV_STALENESS_CEILING_MS))? {
            config.sync.staleness_ceiling = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(ENV_BACKOFF_INITIAL_MS, var(ENV_BACKOFF_INITIAL_MS))? {
            config.sync.backoff_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(ENV_BACKOFF_MAX_MS, var(ENV_BACKOFF_MAX_MS))? {
            config.sync.backoff_max = Duration::from_millis(ms);
        }
        if let Some(n) = parse_number(ENV_RESYNC_AFTER_FAILURES, var(ENV_RESYNC_AFTER_FAILURES))? {
            config.sync.resync_after_failures = clamp_u32(n);
        }
        if let Some(n) = parse_number(ENV_STARTUP_RETRIES, var(ENV_STARTUP_RETRIES))? {
            config.sync.startup_retries = clamp_u32(n);
        }

        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consul_url.trim().is_empty() {
            return Err(ConfigError::Empty("consul_url"));
        }
        if self.key_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Empty("key_prefix"));
        }
        if self.identity_claim.is_empty() {
            return Err(ConfigError::Empty("identity_claim"));
        }
        if self.sync.staleness_ceiling.is_zero() {
            return Err(ConfigError::Zero("staleness_ceiling"));
        }
        if self.sync.watch_timeout >= self.sync.staleness_ceiling {
            return Err(ConfigError::WatchExceedsCeiling {
                watch_ms: self.sync.watch_timeout.as_millis(),
                ceiling_ms: self.sync.staleness_ceiling.as_millis(),
            });
        }
        if self.sync.resync_after_failures == 0 {
            return Err(ConfigError::Zero("resync_after_failures"));
        }
        Ok(())
    }
}

fn parse_number(name: &'static str, raw: Option<String>) -> Result<Option<u64>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
    }
}

fn clamp_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

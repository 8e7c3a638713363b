//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

/// Default namespace tag prepended to every cache key.
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "LKS1:";

/// Lock lifetime. Must outlive the backing store's own internal retry
/// window, since a lock that expires mid-retry re-opens the key to stale
/// replenishment.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(32);

/// Largest serialized entity the cache will hold.
pub const DEFAULT_MAX_CACHE_VALUE_BYTES: usize = 1024 * 1024;

/// Coherence layer configuration.
///
/// Durations of zero mean "no expiry" for `entity_ttl` and `absent_ttl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Namespace tag for cache keys; keeps entries apart from unrelated
    /// users of a shared cache cluster.
    pub cache_key_prefix: String,
    pub lock_ttl: Duration,
    pub entity_ttl: Duration,
    pub absent_ttl: Duration,
    /// Backing-store per-call item limits.
    pub get_limit: usize,
    pub put_limit: usize,
    pub delete_limit: usize,
    /// Per-call item limit for bulk cache reads and writes.
    pub cache_get_limit: usize,
    pub max_cache_value_bytes: usize,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
            entity_ttl: Duration::ZERO,
            absent_ttl: Duration::ZERO,
            get_limit: 1000,
            put_limit: 500,
            delete_limit: 500,
            cache_get_limit: 1000,
            max_cache_value_bytes: DEFAULT_MAX_CACHE_VALUE_BYTES,
        }
    }
}

impl LockstepConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `LOCKSTEP_CACHE_KEY_PREFIX` (default: "LKS1:")
    /// - `LOCKSTEP_LOCK_TTL_MS` (default: 32000)
    /// - `LOCKSTEP_ENTITY_TTL_MS` (default: 0, no expiry)
    /// - `LOCKSTEP_ABSENT_TTL_MS` (default: 0, no expiry)
    /// - `LOCKSTEP_GET_LIMIT` (default: 1000)
    /// - `LOCKSTEP_PUT_LIMIT` (default: 500)
    /// - `LOCKSTEP_DELETE_LIMIT` (default: 500)
    /// - `LOCKSTEP_CACHE_GET_LIMIT` (default: 1000)
    /// - `LOCKSTEP_MAX_CACHE_VALUE_BYTES` (default: 1048576)
    ///
    /// Unparseable values fall back to the default; call [`validate`] on
    /// the result before use.
    ///
    /// [`validate`]: LockstepConfig::validate
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_key_prefix =
            std::env::var("LOCKSTEP_CACHE_KEY_PREFIX").unwrap_or(defaults.cache_key_prefix);

        Self {
            cache_key_prefix,
            lock_ttl: env_millis("LOCKSTEP_LOCK_TTL_MS").unwrap_or(defaults.lock_ttl),
            entity_ttl: env_millis("LOCKSTEP_ENTITY_TTL_MS").unwrap_or(defaults.entity_ttl),
            absent_ttl: env_millis("LOCKSTEP_ABSENT_TTL_MS").unwrap_or(defaults.absent_ttl),
            get_limit: env_parse("LOCKSTEP_GET_LIMIT").unwrap_or(defaults.get_limit),
            put_limit: env_parse("LOCKSTEP_PUT_LIMIT").unwrap_or(defaults.put_limit),
            delete_limit: env_parse("LOCKSTEP_DELETE_LIMIT").unwrap_or(defaults.delete_limit),
            cache_get_limit: env_parse("LOCKSTEP_CACHE_GET_LIMIT")
                .unwrap_or(defaults.cache_get_limit),
            max_cache_value_bytes: env_parse("LOCKSTEP_MAX_CACHE_VALUE_BYTES")
                .unwrap_or(defaults.max_cache_value_bytes),
        }
    }

    pub fn with_cache_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.cache_key_prefix = prefix.into();
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_entity_ttl(mut self, ttl: Duration) -> Self {
        self.entity_ttl = ttl;
        self
    }

    pub fn with_absent_ttl(mut self, ttl: Duration) -> Self {
        self.absent_ttl = ttl;
        self
    }

    /// Set the three backing-store limits at once.
    pub fn with_store_limits(mut self, get: usize, put: usize, delete: usize) -> Self {
        self.get_limit = get;
        self.put_limit = put;
        self.delete_limit = delete;
        self
    }

    pub fn with_cache_get_limit(mut self, limit: usize) -> Self {
        self.cache_get_limit = limit;
        self
    }

    pub fn with_max_cache_value_bytes(mut self, max: usize) -> Self {
        self.max_cache_value_bytes = max;
        self
    }

    /// Reject configurations the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_key_prefix.is_empty() {
            return Err(invalid(
                "cache_key_prefix",
                "",
                "must not be empty in a shared cache",
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(invalid(
                "lock_ttl",
                "0",
                "a lock that never expires can wedge a key forever",
            ));
        }
        for (field, value) in [
            ("get_limit", self.get_limit),
            ("put_limit", self.put_limit),
            ("delete_limit", self.delete_limit),
            ("cache_get_limit", self.cache_get_limit),
        ] {
            if value == 0 {
                return Err(invalid(field, "0", "must be at least 1"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

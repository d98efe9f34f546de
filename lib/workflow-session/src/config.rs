// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration for workflow session coordination
//!
//! Mirrors the `workflow_session` block of the gateway config file. Values are
//! kept in the file's units (minutes / milliseconds); non-positive values fall
//! back to defaults. Credentials may be written as `${ENV_VAR}` placeholders.

use serde::{Deserialize, Deserializer, Serialize, de};
use std::fmt;
use std::time::Duration;

use crate::manager::ManagerConfig;

const DEFAULT_MAPPING_TTL_MINUTES: u64 = 24 * 60;
const DEFAULT_LOCK_TTL_MS: u64 = 120_000;
const DEFAULT_LOCK_WAIT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 200;

const DEFAULT_REDIS_ADDR: &str = "127.0.0.1:6379";
const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_POOL_SIZE: usize = 10;

/// Placeholder shown instead of secrets when a config is displayed.
pub const REDACTED_VALUE: &str = "__REDACTED__";

/// Remote store connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// `host:port`; empty disables the remote store
    pub addr: String,
    pub username: String,
    pub password: String,
    pub db: i64,
    #[serde(deserialize_with = "non_positive_as_zero")]
    pub dial_timeout_ms: u64,
    #[serde(deserialize_with = "non_positive_as_zero")]
    pub read_timeout_ms: u64,
    #[serde(deserialize_with = "non_positive_as_zero")]
    pub write_timeout_ms: u64,
    #[serde(deserialize_with = "non_positive_as_zero_usize")]
    pub pool_size: usize,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_REDIS_ADDR.to_string(),
            username: String::new(),
            password: String::new(),
            db: 0,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl RedisSettings {
    pub fn is_enabled(&self) -> bool {
        !self.addr.trim().is_empty()
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    #[cfg(feature = "redis-storage")]
    pub fn to_client_config(&self) -> crate::redis_client::RedisConfig {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        crate::redis_client::RedisConfig {
            addr: self.addr.trim().to_string(),
            username: non_empty(&self.username),
            password: non_empty(&self.password),
            db: self.db,
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            pool_size: self.pool_size,
        }
    }

    /// Fill zero timeouts and pool size with defaults. `addr` is left as is:
    /// an explicitly empty address keeps the remote store disabled.
    fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.dial_timeout_ms == 0 {
            self.dial_timeout_ms = defaults.dial_timeout_ms;
        }
        if self.read_timeout_ms == 0 {
            self.read_timeout_ms = defaults.read_timeout_ms;
        }
        if self.write_timeout_ms == 0 {
            self.write_timeout_ms = defaults.write_timeout_ms;
        }
        if self.pool_size == 0 {
            self.pool_size = defaults.pool_size;
        }
        self
    }
}

/// Workflow session coordination settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSessionConfig {
    #[serde(deserialize_with = "non_positive_as_zero")]
    pub mapping_ttl_minutes: u64,
    #[serde(deserialize_with = "non_positive_as_zero")]
    pub lock_ttl_ms: u64,
    #[serde(deserialize_with = "non_positive_as_zero")]
    pub lock_wait_timeout_ms: u64,
    #[serde(deserialize_with = "non_positive_as_zero")]
    pub lock_retry_interval_ms: u64,
    /// Absent means "try the default local Redis"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisSettings>,
}

impl Default for WorkflowSessionConfig {
    fn default() -> Self {
        Self {
            mapping_ttl_minutes: DEFAULT_MAPPING_TTL_MINUTES,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            lock_wait_timeout_ms: DEFAULT_LOCK_WAIT_TIMEOUT_MS,
            lock_retry_interval_ms: DEFAULT_LOCK_RETRY_INTERVAL_MS,
            redis: Some(RedisSettings::default()),
        }
    }
}

impl WorkflowSessionConfig {
    /// Create config from environment variables
    ///
    /// # Environment Variables
    ///
    /// - `WORKFLOW_SESSION_MAPPING_TTL_MINUTES`: Mapping TTL in minutes (default: 1440)
    /// - `WORKFLOW_SESSION_LOCK_TTL_MS`: Lease TTL in milliseconds (default: 120000)
    /// - `WORKFLOW_SESSION_LOCK_WAIT_TIMEOUT_MS`: Max wait for another creator (default: 120000)
    /// - `WORKFLOW_SESSION_LOCK_RETRY_INTERVAL_MS`: Poll interval while waiting (default: 200)
    /// - `WORKFLOW_SESSION_REDIS_ADDR`: Redis `host:port`; empty disables Redis (default: 127.0.0.1:6379)
    /// - `WORKFLOW_SESSION_REDIS_USERNAME` / `WORKFLOW_SESSION_REDIS_PASSWORD`: credentials
    /// - `WORKFLOW_SESSION_REDIS_DB`: database index (default: 0)
    /// - `WORKFLOW_SESSION_REDIS_POOL_SIZE`: pool size (default: 10)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) against an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let defaults = Self::default();

        let mut redis = RedisSettings::default();
        if let Some(addr) = lookup("WORKFLOW_SESSION_REDIS_ADDR") {
            redis.addr = addr;
        }
        if let Some(username) = lookup("WORKFLOW_SESSION_REDIS_USERNAME") {
            redis.username = username;
        }
        if let Some(password) = lookup("WORKFLOW_SESSION_REDIS_PASSWORD") {
            redis.password = password;
        }
        if let Some(db) = lookup("WORKFLOW_SESSION_REDIS_DB").and_then(|s| s.trim().parse().ok()) {
            redis.db = db;
        }
        if let Some(pool_size) = number("WORKFLOW_SESSION_REDIS_POOL_SIZE") {
            redis.pool_size = pool_size as usize;
        }

        Self {
            mapping_ttl_minutes: number("WORKFLOW_SESSION_MAPPING_TTL_MINUTES")
                .unwrap_or(defaults.mapping_ttl_minutes),
            lock_ttl_ms: number("WORKFLOW_SESSION_LOCK_TTL_MS").unwrap_or(defaults.lock_ttl_ms),
            lock_wait_timeout_ms: number("WORKFLOW_SESSION_LOCK_WAIT_TIMEOUT_MS")
                .unwrap_or(defaults.lock_wait_timeout_ms),
            lock_retry_interval_ms: number("WORKFLOW_SESSION_LOCK_RETRY_INTERVAL_MS")
                .unwrap_or(defaults.lock_retry_interval_ms),
            redis: Some(redis),
        }
        .with_defaults()
    }

    /// Replace non-positive values with defaults and fill a missing `redis`
    /// block with the default local Redis settings.
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.mapping_ttl_minutes == 0 {
            self.mapping_ttl_minutes = defaults.mapping_ttl_minutes;
        }
        if self.lock_ttl_ms == 0 {
            self.lock_ttl_ms = defaults.lock_ttl_ms;
        }
        if self.lock_wait_timeout_ms == 0 {
            self.lock_wait_timeout_ms = defaults.lock_wait_timeout_ms;
        }
        if self.lock_retry_interval_ms == 0 {
            self.lock_retry_interval_ms = defaults.lock_retry_interval_ms;
        }
        self.redis = Some(self.redis.unwrap_or_default().with_defaults());
        self
    }

    /// Resolve `${ENV_VAR}` placeholders in the Redis credentials.
    pub fn resolve_env_placeholders(self) -> Self {
        self.resolve_placeholders_with(|key| std::env::var(key).ok())
    }

    pub fn resolve_placeholders_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(redis) = self.redis.as_mut() {
            redis.username = resolve_placeholder(&redis.username, &lookup);
            redis.password = resolve_placeholder(&redis.password, &lookup);
        }
        self
    }

    /// Copy safe to display: the Redis password is replaced by [`REDACTED_VALUE`].
    pub fn redacted(&self) -> Self {
        let mut clone = self.clone();
        if let Some(redis) = clone.redis.as_mut() {
            if !redis.password.is_empty() {
                redis.password = REDACTED_VALUE.to_string();
            }
        }
        clone
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            mapping_ttl: Duration::from_secs(self.mapping_ttl_minutes.saturating_mul(60)),
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            lock_wait_timeout: Duration::from_millis(self.lock_wait_timeout_ms),
            lock_retry_interval: Duration::from_millis(self.lock_retry_interval_ms),
        }
    }

    /// Configuration lints. Reported, never auto-corrected.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.lock_ttl_ms > 0
            && self.lock_wait_timeout_ms > 0
            && self.lock_ttl_ms < self.lock_wait_timeout_ms
        {
            warnings.push(format!(
                "workflow_session.lock_ttl_ms ({}) should be >= lock_wait_timeout_ms ({}) to avoid premature lock expiry",
                self.lock_ttl_ms, self.lock_wait_timeout_ms
            ));
        }
        warnings
    }
}

/// Accept any JSON integer, mapping negatives to 0 so `with_defaults` replaces
/// them like any other non-positive value.
fn non_positive_as_zero<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct NonNegative;

    impl de::Visitor<'_> for NonNegative {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an integer")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            Ok(u64::try_from(v).unwrap_or(0))
        }
    }

    deserializer.deserialize_any(NonNegative)
}

fn non_positive_as_zero_usize<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    non_positive_as_zero(deserializer).map(|v| usize::try_from(v).unwrap_or(usize::MAX))
}

/// Resolve a whole-value `${KEY}` placeholder; anything else is returned as is.
/// An unset variable resolves to the empty string.
pub fn resolve_placeholder(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let trimmed = value.trim();
    match trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(key) => lookup(key).unwrap_or_default(),
        None => value.to_string(),
    }
}

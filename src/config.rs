//! Gateway configuration
//!
//! Loaded from the adapter's JSON settings, then patched from
//! `SOCKETGATE_*` environment variables.

use crate::acl::IpWhitelist;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Burst protection thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BurstConfig {
    pub enabled: bool,
    /// Events per interval above which an interval counts as overloaded
    pub value_threshold: u64,
    /// Consecutive overloaded intervals before activation
    pub repeat_intervals: u32,
    pub interval_ms: u64,
    /// Time after activation before subscriptions are restored
    pub cooldown_ms: u64,
    /// Pattern kept subscribed while active
    pub system_pattern: String,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            value_threshold: 200,
            repeat_intervals: 3,
            interval_ms: 1000,
            cooldown_ms: 60_000,
            system_pattern: "system.adapter.*".to_string(),
        }
    }
}

impl BurstConfig {
    /// Sample period, never shorter than 1ms
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Host result cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    /// Host commands whose answers may be reused
    pub commands: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 500,
            commands: [
                "getRepository",
                "getInstalled",
                "getInstalledAdapter",
                "getVersion",
                "getDiagData",
                "getLocationOnDisk",
                "getDevList",
                "getLogs",
                "getHostInfo",
                "getHostInfoShort",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl CacheConfig {
    /// Entry lifetime and GC period, never shorter than 1ms
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Require authentication
    pub auth: bool,
    /// Identity used when authentication is disabled
    pub default_user: String,
    /// Per-IP ACL overrides; empty disables the whitelist
    pub whitelist: IpWhitelist,
    /// Minimum time between session store re-reads for one connection
    pub freshness_interval_ms: u64,
    /// How long a host command may take before the caller gets `timeout`
    pub host_timeout_ms: u64,
    /// Debounce for the connected-clients status
    pub clients_debounce_ms: u64,
    /// Outbound queue depth per connection
    pub outbound_buffer: usize,
    /// Adapter name reported to clients
    pub adapter_name: String,
    /// Instance id reported to clients (`admin.0`)
    pub instance: String,
    pub burst: BurstConfig,
    pub cache: CacheConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth: false,
            default_user: "admin".to_string(),
            whitelist: IpWhitelist::default(),
            freshness_interval_ms: 60_000,
            host_timeout_ms: 5_000,
            clients_debounce_ms: 1_000,
            outbound_buffer: 256,
            adapter_name: "admin".to_string(),
            instance: "admin.0".to_string(),
            burst: BurstConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject periods that would drive a timer with a zero duration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst.interval_ms == 0 {
            return Err(ConfigError::Zero("burst.intervalMs"));
        }
        if self.cache.ttl_ms == 0 {
            return Err(ConfigError::Zero("cache.ttlMs"));
        }
        Ok(())
    }

    /// Read a JSON settings file and apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config = Self::from_json_str(&raw)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.apply_env().context("Invalid environment override")?;
        Ok(config)
    }

    /// Apply `SOCKETGATE_AUTH`, `SOCKETGATE_DEFAULT_USER` and `SOCKETGATE_CACHE`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("SOCKETGATE_AUTH") {
            self.auth = parse_bool("SOCKETGATE_AUTH", &v)?;
        }
        if let Some(v) = lookup("SOCKETGATE_DEFAULT_USER") {
            self.default_user = v;
        }
        if let Some(v) = lookup("SOCKETGATE_CACHE") {
            self.cache.enabled = parse_bool("SOCKETGATE_CACHE", &v)?;
        }
        Ok(())
    }

    pub fn freshness_interval(&self) -> Duration {
        Duration::from_millis(self.freshness_interval_ms)
    }

    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(self.host_timeout_ms)
    }

    pub fn clients_debounce(&self) -> Duration {
        Duration::from_millis(self.clients_debounce_ms)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

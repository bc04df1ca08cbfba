//! Relay configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use icy_relay_core::ProxyConfig;
use serde::Deserialize;

/// Relay configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Preferred local port for the decoder to connect to.
    /// Override: `ICY_RELAY_PORT`
    pub port: u16,

    /// Number of following ports to try when `port` is taken.
    pub port_retry_count: u16,

    /// Remote connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Seconds of remote silence before the session is dropped.
    /// Override: `ICY_RELAY_IDLE_TIMEOUT`
    pub idle_timeout_secs: u64,

    /// Seconds to wait for the decoder to connect (0 = forever).
    pub accept_timeout_secs: u64,

    /// Report every metadata block, even when unchanged.
    pub emit_duplicate_metadata: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let core = ProxyConfig::default();
        Self {
            port: core.port,
            port_retry_count: core.port_retry_count,
            connect_timeout_secs: core.connect_timeout_secs,
            idle_timeout_secs: core.idle_timeout_secs,
            accept_timeout_secs: core.accept_timeout_secs,
            emit_duplicate_metadata: core.emit_duplicate_metadata,
        }
    }
}

impl RelayConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies overrides from `lookup` (the process environment in production).
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("ICY_RELAY_PORT") {
            match val.parse() {
                Ok(port) => self.port = port,
                Err(_) => log::warn!("Ignoring invalid ICY_RELAY_PORT '{}'", val),
            }
        }

        if let Some(val) = lookup("ICY_RELAY_IDLE_TIMEOUT") {
            match val.parse() {
                Ok(secs) => self.idle_timeout_secs = secs,
                Err(_) => log::warn!("Ignoring invalid ICY_RELAY_IDLE_TIMEOUT '{}'", val),
            }
        }
    }

    /// Converts to icy-relay-core's config type.
    pub fn to_proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            port: self.port,
            port_retry_count: self.port_retry_count,
            connect_timeout_secs: self.connect_timeout_secs,
            idle_timeout_secs: self.idle_timeout_secs,
            accept_timeout_secs: self.accept_timeout_secs,
            emit_duplicate_metadata: self.emit_duplicate_metadata,
            ..Default::default()
        }
    }
}

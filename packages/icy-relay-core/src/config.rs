//! Proxy configuration.
//!
//! [`ProxyConfig`] groups the tunables of a proxy instance: where it listens,
//! how long it waits on each side, and how much data it buffers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_HEADER_BYTES,
    DEFAULT_PORT_RETRY_COUNT, DEFAULT_PROXY_PORT, DEFAULT_READ_CHUNK_SIZE,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_WRITE_TIMEOUT_SECS,
};

/// Configuration for an [`IcyStreamProxy`](crate::proxy::IcyStreamProxy).
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Preferred local listening port (0 = let the OS pick).
    pub port: u16,

    /// How many following ports to try when `port` is already in use.
    pub port_retry_count: u16,

    /// Remote connect timeout (seconds).
    pub connect_timeout_secs: u64,

    /// Timeout for the local client's initial request (seconds).
    pub request_timeout_secs: u64,

    /// Maximum silence from the remote before the session is dropped (seconds).
    pub idle_timeout_secs: u64,

    /// Maximum time a single write to the local client may block (seconds).
    pub write_timeout_secs: u64,

    /// How long `run()` waits for the local client (seconds, 0 = forever).
    pub accept_timeout_secs: u64,

    /// Upper bound on request and response header blocks (bytes).
    pub max_header_bytes: usize,

    /// Bytes read from the remote per loop iteration.
    pub read_chunk_size: usize,

    /// Emit a metadata event for every block, even when unchanged.
    pub emit_duplicate_metadata: bool,
}

impl ProxyConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.read_chunk_size == 0 {
            return Err("read_chunk_size must be >= 1".to_string());
        }
        if self.max_header_bytes < 64 {
            return Err("max_header_bytes must be >= 64".to_string());
        }
        if self.connect_timeout_secs == 0 {
            return Err("connect_timeout_secs must be >= 1".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be >= 1".to_string());
        }
        if self.idle_timeout_secs == 0 {
            return Err("idle_timeout_secs must be >= 1".to_string());
        }
        if self.write_timeout_secs == 0 {
            return Err("write_timeout_secs must be >= 1".to_string());
        }
        if self.port == 0 && self.port_retry_count > 0 {
            log::debug!("[Config] port_retry_count ignored for OS-assigned port");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Returns the accept timeout, or `None` to wait indefinitely.
    pub fn accept_timeout(&self) -> Option<Duration> {
        (self.accept_timeout_secs > 0).then(|| Duration::from_secs(self.accept_timeout_secs))
    }

    /// Ports to attempt, in order.
    pub fn candidate_ports(&self) -> impl Iterator<Item = u16> {
        let retries = if self.port == 0 {
            0
        } else {
            self.port_retry_count
        };
        let start = self.port;
        (0..=retries).filter_map(move |offset| start.checked_add(offset))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROXY_PORT,
            port_retry_count: DEFAULT_PORT_RETRY_COUNT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            accept_timeout_secs: 0,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            emit_duplicate_metadata: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 6666);
        assert_eq!(config.accept_timeout(), None);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = ProxyConfig {
            read_chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_session_timeouts_are_rejected() {
        for config in [
            ProxyConfig {
                write_timeout_secs: 0,
                ..Default::default()
            },
            ProxyConfig {
                request_timeout_secs: 0,
                ..Default::default()
            },
        ] {
            let err = config.validate().unwrap_err();
            assert!(err.contains("timeout_secs must be >= 1"), "{err}");
        }
    }

    #[test]
    fn candidate_ports_cover_retry_range() {
        let config = ProxyConfig {
            port: 7000,
            port_retry_count: 2,
            ..Default::default()
        };
        let ports: Vec<u16> = config.candidate_ports().collect();
        assert_eq!(ports, vec![7000, 7001, 7002]);
    }

    #[test]
    fn candidate_ports_do_not_overflow() {
        let config = ProxyConfig {
            port: u16::MAX,
            port_retry_count: 3,
            ..Default::default()
        };
        let ports: Vec<u16> = config.candidate_ports().collect();
        assert_eq!(ports, vec![u16::MAX]);
    }

    #[test]
    fn os_assigned_port_is_tried_once() {
        let config = ProxyConfig {
            port: 0,
            ..Default::default()
        };
        assert_eq!(config.candidate_ports().count(), 1);
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: ProxyConfig = serde_json::from_str(r#"{"port": 7777}"#).unwrap();
        assert_eq!(config.port, 7777);
        assert_eq!(config.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT_SECS);
    }
}

//! Centralized error types for the ICY relay core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to stable machine-readable codes for event payloads
//! - Separates proxy-fatal errors (no local endpoint) from session errors

use std::io;

use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for event payloads.
    fn code(&self) -> &'static str;
}

/// Error type for proxy construction and session handling.
///
/// "No `icy-metaint` header" is deliberately absent: a stream without
/// metadata is still relayed (see [`crate::stream::MetaInterval::Absent`]).
#[derive(Debug, Error)]
pub enum ProxyError {
    /// TCP connection to the remote stream server could not be established.
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The local listening socket could not be bound.
    #[error("Failed to bind local proxy port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Malformed URL, client request, response headers or metadata framing.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Read/write failure on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Proxy configuration rejected by validation.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProxyError {
    /// Convenience constructor for protocol errors.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Builds an `Io` error of kind `TimedOut` for the given operation.
    pub fn timed_out(what: &str) -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out", what),
        ))
    }

    /// Returns true for errors that leave the proxy without a usable local
    /// endpoint. Callers should fall back to playing the remote URL directly.
    #[must_use]
    pub fn is_fatal_to_proxy(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Bind { .. } | Self::Configuration(_)
        )
    }
}

impl ErrorCode for ProxyError {
    fn code(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect_failed",
            Self::Bind { .. } => "bind_failed",
            Self::Protocol(_) => "protocol_error",
            Self::Io(_) => "io_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

/// Convenient Result alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

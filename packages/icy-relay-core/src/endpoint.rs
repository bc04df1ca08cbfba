//! Remote endpoint description and local URL building.
//!
//! [`Endpoint`] captures the upstream stream server a proxy relays from.
//! [`UrlBuilder`] produces the local URL handed to the decoder.

use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol_constants::HTTP_DEFAULT_PORT;

/// Upstream ICY/Shoutcast server address.
///
/// Immutable once parsed. Only plain `http` URLs are supported since the
/// proxy speaks the ICY protocol on the raw TCP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    /// Parses a remote stream URL.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] if the URL is malformed, has no host
    /// or uses a scheme other than `http`.
    pub fn parse(raw: &str) -> ProxyResult<Self> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::protocol(format!("invalid stream URL '{}': {}", raw, e)))?;

        if url.scheme() != "http" {
            return Err(ProxyError::protocol(format!(
                "unsupported scheme '{}' (only http is proxied)",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::protocol(format!("stream URL '{}' has no host", raw)))?
            .to_string();
        let port = url.port().unwrap_or(HTTP_DEFAULT_PORT);

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            url: raw.to_string(),
            host,
            port,
            path,
        })
    }

    /// The URL as originally supplied (used for direct-playback fallback).
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resource path including the query string (always starts with `/`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port` pair suitable for `TcpStream::connect`.
    pub fn connect_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the HTTP `Host` header (port omitted when it is 80).
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == HTTP_DEFAULT_PORT {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.connect_addr())
    }
}

/// Builder for the local URLs a decoder connects to.
pub struct UrlBuilder {
    addr: SocketAddr,
}

impl UrlBuilder {
    /// Creates a new `UrlBuilder` for the given listener address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Returns the base URL for the listener (e.g., `http://127.0.0.1:6666`).
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Returns the proxy URL mirroring the remote resource path.
    #[must_use]
    pub fn proxy_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

//! HTTP/ICY header handling for both sides of the proxy.
//!
//! - [`ClientRequest`]: the local decoder's request, rewritten for upstream
//! - [`ResponseHeaders`]: the server's ICY response, parsed and cleaned for
//!   the local client

use bytes::Bytes;

use super::icy::MetaInterval;
use crate::endpoint::Endpoint;
use crate::error::{ProxyError, ProxyResult};
use crate::events::StationInfo;
use crate::protocol_constants::{
    CRLF, HEADER_TERMINATOR, ICY_METADATA_REQUEST_HEADER, ICY_METAINT_HEADER,
};

/// Returns the length of the header block including the `\r\n\r\n` marker,
/// or `None` if the marker has not arrived yet.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Splits a header block (with or without its terminator) into lines.
fn header_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    let body = block
        .strip_suffix(HEADER_TERMINATOR)
        .unwrap_or(block);
    body.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

/// Splits `Name: value` into a trimmed name and value.
fn split_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim(), value.trim()))
}

/// The local client's initial HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    request_line: String,
    path: String,
    headers: Vec<String>,
}

impl ClientRequest {
    /// Parses a complete request header block.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] unless the first line has the form
    /// `GET <path> HTTP/1.x`.
    pub fn parse(block: &[u8]) -> ProxyResult<Self> {
        let text = String::from_utf8_lossy(block);
        let mut lines = header_lines(text.as_bytes())
            .map(|l| String::from_utf8_lossy(l).into_owned());

        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ProxyError::protocol("empty client request"))?;

        let mut parts = request_line.split_whitespace();
        let (method, path, version) = (parts.next(), parts.next(), parts.next());
        let path = match (method, path, version) {
            (Some("GET"), Some(path), Some(version))
                if version.starts_with("HTTP/1.") && parts.next().is_none() =>
            {
                path.to_string()
            }
            _ => {
                return Err(ProxyError::protocol(format!(
                    "malformed client request line '{}'",
                    request_line
                )))
            }
        };

        let headers = lines.filter(|l| !l.is_empty()).collect();

        Ok(Self {
            request_line,
            path,
            headers,
        })
    }

    /// Requested resource path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Builds the request sent upstream.
    ///
    /// The request line and headers are kept verbatim except that `Host` is
    /// pointed at the remote server, any client `Icy-MetaData` header is
    /// dropped, and `Icy-MetaData:1` is appended before the blank line.
    pub fn to_upstream(&self, endpoint: &Endpoint) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str(&self.request_line);
        out.push_str(CRLF);

        let mut host_written = false;
        for header in &self.headers {
            let name = split_header(header).map(|(n, _)| n).unwrap_or("");
            if name.eq_ignore_ascii_case("icy-metadata") {
                continue;
            }
            if name.eq_ignore_ascii_case("host") {
                out.push_str(&format!("Host: {}{}", endpoint.host_header(), CRLF));
                host_written = true;
                continue;
            }
            out.push_str(header);
            out.push_str(CRLF);
        }
        if !host_written {
            out.push_str(&format!("Host: {}{}", endpoint.host_header(), CRLF));
        }

        out.push_str(ICY_METADATA_REQUEST_HEADER);
        out.push_str(CRLF);
        out.into_bytes()
    }
}

/// Parsed response header block from the stream server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeaders {
    /// Status code from the status line, if the server sent one.
    pub status: Option<u16>,
    pub meta_interval: MetaInterval,
    pub station: StationInfo,
    /// Header block to forward to the local client (`icy-metaint` removed).
    ///
    /// Every line is re-terminated with CRLF, so bare-LF headers from the
    /// server reach the client normalised.
    pub forwarded: Bytes,
}

impl ResponseHeaders {
    /// Parses a complete response header block, terminator included.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] if the status line reports a
    /// non-success status.
    pub fn parse(block: &[u8]) -> ProxyResult<Self> {
        let mut status = None;
        let mut meta_interval = MetaInterval::Absent;
        let mut station = StationInfo::default();
        let mut forwarded: Vec<u8> = Vec::with_capacity(block.len());

        for (index, raw) in header_lines(block).enumerate() {
            let line = String::from_utf8_lossy(raw);

            if index == 0 && is_status_line(&line) {
                status = parse_status_code(&line);
                match status {
                    Some(code) if (200..300).contains(&code) => {}
                    _ => {
                        return Err(ProxyError::protocol(format!(
                            "stream server answered '{}'",
                            line.trim()
                        )))
                    }
                }
            } else if let Some((name, value)) = split_header(&line) {
                let name = name.to_ascii_lowercase();
                match name.as_str() {
                    ICY_METAINT_HEADER => {
                        meta_interval = match value.parse::<usize>() {
                            Ok(n) if n > 0 => MetaInterval::Every(n),
                            _ => {
                                log::warn!(
                                    "[ICY] Ignoring unusable {} value '{}'",
                                    ICY_METAINT_HEADER,
                                    value
                                );
                                MetaInterval::Absent
                            }
                        };
                        continue;
                    }
                    "icy-name" => station.name = non_empty(value),
                    "icy-genre" => station.genre = non_empty(value),
                    "icy-url" => station.url = non_empty(value),
                    "icy-br" => station.bitrate = value.parse().ok(),
                    _ => {}
                }
            }

            forwarded.extend_from_slice(raw);
            forwarded.extend_from_slice(CRLF.as_bytes());
        }
        forwarded.extend_from_slice(CRLF.as_bytes());

        Ok(Self {
            status,
            meta_interval,
            station,
            forwarded: Bytes::from(forwarded),
        })
    }
}

fn is_status_line(line: &str) -> bool {
    line.starts_with("HTTP/") || line.starts_with("ICY ")
}

fn parse_status_code(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::parse("http://radio.example.com:8000/live").unwrap()
    }

    #[test]
    fn finds_header_end_after_marker() {
        let buf = b"ICY 200 OK\r\nicy-metaint: 10\r\n\r\nAUDIO";
        let end = find_header_end(buf).unwrap();
        assert_eq!(&buf[end..], b"AUDIO");
        assert_eq!(find_header_end(b"ICY 200 OK\r\n"), None);
    }

    #[test]
    fn parses_get_request() {
        let req = ClientRequest::parse(b"GET /live HTTP/1.1\r\nHost: 127.0.0.1:6666\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/live");
    }

    #[test]
    fn rejects_malformed_request_lines() {
        for block in [
            &b"\r\n\r\n"[..],
            b"POST /live HTTP/1.1\r\n\r\n",
            b"GET /live\r\n\r\n",
            b"GET /live FTP/1.0\r\n\r\n",
            b"hello world\r\n\r\n",
        ] {
            let err = ClientRequest::parse(block).unwrap_err();
            assert!(matches!(err, ProxyError::Protocol(_)), "{block:?}");
        }
    }

    #[test]
    fn upstream_request_injects_metadata_header() {
        let req = ClientRequest::parse(
            b"GET /live HTTP/1.1\r\nHost: 127.0.0.1:6666\r\nUser-Agent: decoder\r\n\r\n",
        )
        .unwrap();
        let upstream = String::from_utf8(req.to_upstream(&endpoint())).unwrap();
        assert_eq!(
            upstream,
            "GET /live HTTP/1.1\r\n\
             Host: radio.example.com:8000\r\n\
             User-Agent: decoder\r\n\
             Icy-MetaData:1\r\n\r\n"
        );
    }

    #[test]
    fn upstream_request_replaces_client_metadata_header() {
        let req =
            ClientRequest::parse(b"GET /live HTTP/1.0\r\nicy-metadata: 0\r\n\r\n").unwrap();
        let upstream = String::from_utf8(req.to_upstream(&endpoint())).unwrap();
        assert_eq!(upstream.matches("Icy-MetaData").count(), 1);
        assert!(!upstream.contains("icy-metadata: 0"));
        assert!(upstream.contains("Host: radio.example.com:8000\r\n"));
        assert!(upstream.ends_with("Icy-MetaData:1\r\n\r\n"));
    }

    #[test]
    fn parses_metaint_case_insensitively() {
        for line in ["icy-metaint: 8192", "ICY-METAINT:8192", "Icy-MetaInt:   8192"] {
            let block = format!("ICY 200 OK\r\n{}\r\n\r\n", line);
            let headers = ResponseHeaders::parse(block.as_bytes()).unwrap();
            assert_eq!(headers.meta_interval, MetaInterval::Every(8192), "{line}");
        }
    }

    #[test]
    fn forwarded_headers_drop_metaint_only() {
        let block = b"ICY 200 OK\r\nicy-name: Test FM\r\nicy-metaint: 16000\r\nicy-br: 128\r\n\r\n";
        let headers = ResponseHeaders::parse(block).unwrap();
        assert_eq!(headers.status, Some(200));
        assert_eq!(
            &headers.forwarded[..],
            &b"ICY 200 OK\r\nicy-name: Test FM\r\nicy-br: 128\r\n\r\n"[..]
        );
        assert_eq!(headers.station.name.as_deref(), Some("Test FM"));
        assert_eq!(headers.station.bitrate, Some(128));
    }

    #[test]
    fn forwarded_headers_normalise_line_endings() {
        let headers =
            ResponseHeaders::parse(b"ICY 200 OK\nicy-metaint: 10\nicy-name: Test FM\r\n\r\n").unwrap();
        assert_eq!(headers.meta_interval, MetaInterval::Every(10));
        assert_eq!(&headers.forwarded[..], &b"ICY 200 OK\r\nicy-name: Test FM\r\n\r\n"[..]);
    }

    #[test]
    fn missing_metaint_means_absent() {
        let headers =
            ResponseHeaders::parse(b"HTTP/1.0 200 OK\r\nContent-Type: audio/mpeg\r\n\r\n")
                .unwrap();
        assert_eq!(headers.meta_interval, MetaInterval::Absent);
    }

    #[test]
    fn zero_or_garbage_metaint_is_absent() {
        for value in ["0", "abc", ""] {
            let block = format!("ICY 200 OK\r\nicy-metaint:{}\r\n\r\n", value);
            let headers = ResponseHeaders::parse(block.as_bytes()).unwrap();
            assert_eq!(headers.meta_interval, MetaInterval::Absent, "{value:?}");
        }
    }

    #[test]
    fn status_line_is_optional() {
        let headers = ResponseHeaders::parse(b"icy-metaint: 10\r\n\r\n").unwrap();
        assert_eq!(headers.status, None);
        assert_eq!(headers.meta_interval, MetaInterval::Every(10));
        assert_eq!(&headers.forwarded[..], b"\r\n");
    }

    #[test]
    fn error_status_is_protocol_error() {
        let err = ResponseHeaders::parse(b"HTTP/1.1 404 Not Found\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
        assert!(ResponseHeaders::parse(b"ICY 401 Service Unavailable\r\n\r\n").is_err());
    }
}

//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the ICY (Shoutcast/Icecast) extension to HTTP
//! and changing them would break interoperability with stream servers.

// ─────────────────────────────────────────────────────────────────────────────
// ICY Protocol (Shoutcast/Icecast metadata)
// ─────────────────────────────────────────────────────────────────────────────

/// Size of one metadata length unit (bytes).
///
/// The length byte preceding a metadata block counts 16-byte units, so a
/// block is at most `255 * 16 = 4080` bytes long.
pub const ICY_META_BLOCK_UNIT: usize = 16;

/// Largest possible metadata block payload (bytes).
pub const ICY_MAX_META_BLOCK: usize = u8::MAX as usize * ICY_META_BLOCK_UNIT;

/// Request header asking the server to interleave metadata into the stream.
pub const ICY_METADATA_REQUEST_HEADER: &str = "Icy-MetaData:1\r\n";

/// Response header (lowercase) declaring the metadata interval.
pub const ICY_METAINT_HEADER: &str = "icy-metaint";

/// Metadata key carrying the "now playing" title.
pub const STREAM_TITLE_KEY: &str = "StreamTitle";

/// Metadata key carrying the station or track URL.
pub const STREAM_URL_KEY: &str = "StreamUrl";

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// Marker terminating an HTTP header block.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Line ending used on the wire.
pub const CRLF: &str = "\r\n";

/// Default port of an `http://` URL without an explicit port.
pub const HTTP_DEFAULT_PORT: u16 = 80;

/// Response sent to a local client connecting while a session is active.
pub const BUSY_RESPONSE: &[u8] =
    b"HTTP/1.0 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

// ─────────────────────────────────────────────────────────────────────────────
// Proxy Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default local listening port (the historical proxy port).
pub const DEFAULT_PROXY_PORT: u16 = 6666;

/// Number of additional ports tried after the preferred one is taken.
pub const DEFAULT_PORT_RETRY_COUNT: u16 = 10;

/// Upper bound on request/response header blocks (bytes).
pub const DEFAULT_MAX_HEADER_BYTES: usize = 16 * 1024;

/// Bytes read from the remote per iteration of the reframing loop.
///
/// Also bounds the amount of audio held in memory while the local client
/// is slow to accept writes.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;

/// Timeout for establishing the remote TCP connection (seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout for reading the local client's initial request (seconds).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Timeout without any remote data before the session is dropped (seconds).
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Timeout for one write to the local client (seconds).
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

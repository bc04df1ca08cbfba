//! General utilities shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns a printable preview of a byte buffer for trace logging.
pub(crate) fn preview(bytes: &[u8], max: usize) -> String {
    let end = bytes.len().min(max);
    let mut text = String::from_utf8_lossy(&bytes[..end]).escape_debug().to_string();
    if bytes.len() > max {
        text.push_str("...");
    }
    text
}

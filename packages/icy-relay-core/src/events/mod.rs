//! Event system for metadata and session notifications.
//!
//! This module provides:
//! - [`EventEmitter`] trait the proxy reports through
//! - [`BroadcastEventBridge`] for channel-based subscribers
//! - Event types for track metadata and session lifecycle

mod bridge;
mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::{Deserialize, Serialize};

use crate::proxy::SessionState;

/// "Now playing" information carried by an ICY metadata block.
///
/// Empty strings mean the key was not present in the block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    #[serde(rename = "streamUrl")]
    pub stream_url: String,
}

impl TrackMetadata {
    pub fn new(title: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            stream_url: stream_url.into(),
        }
    }

    /// Returns true when neither key carried a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.stream_url.is_empty()
    }
}

/// Station details announced in the `icy-*` response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Nominal bitrate in kbit/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

/// Events delivered to subscribers.
///
/// Each category has its own inner event type.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum ProxyEvent {
    /// A metadata block yielded new track information.
    Metadata(TrackMetadata),

    /// Session lifecycle changes.
    Session(SessionEvent),
}

/// Events related to the proxy session lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// The session state machine moved to a new state.
    StateChanged {
        state: SessionState,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// The local decoder connected.
    ClientConnected {
        peer: String,
        timestamp: u64,
    },
    /// A further local client was turned away while the session was busy.
    ClientRejected {
        peer: String,
        timestamp: u64,
    },
    /// The remote response headers were received.
    HeadersReceived {
        /// Metadata interval, `None` when the stream carries no metadata.
        #[serde(rename = "metaInt")]
        meta_int: Option<usize>,
        station: StationInfo,
        timestamp: u64,
    },
    /// The server sent no `icy-metaint`; audio is relayed without metadata.
    NoMetadata { timestamp: u64 },
    /// The session finished, cleanly or with an error.
    Ended {
        #[serde(rename = "bytesForwarded")]
        bytes_forwarded: u64,
        #[serde(rename = "metadataBlocks")]
        metadata_blocks: u64,
        /// Machine-readable error code when the session failed.
        #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
        error_code: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: u64,
    },
}

impl From<TrackMetadata> for ProxyEvent {
    fn from(metadata: TrackMetadata) -> Self {
        ProxyEvent::Metadata(metadata)
    }
}

impl From<SessionEvent> for ProxyEvent {
    fn from(event: SessionEvent) -> Self {
        ProxyEvent::Session(event)
    }
}

//! Event emitter abstraction for decoupling the proxy from its observers.
//!
//! The proxy depends on the [`EventEmitter`] trait rather than a concrete
//! channel or UI toolkit, enabling testing and alternative delivery.

use super::{SessionEvent, TrackMetadata};

/// Trait for emitting proxy events without knowledge of transport.
///
/// Implementations are called from the session task and must not block:
/// the audio relay waits for each call to return.
pub trait EventEmitter: Send + Sync {
    /// Emits a "now playing" change.
    fn emit_metadata(&self, metadata: TrackMetadata);

    /// Emits a session lifecycle event.
    fn emit_session(&self, event: SessionEvent);
}

/// No-op emitter for embedding without observers, or testing.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_metadata(&self, _metadata: TrackMetadata) {}

    fn emit_session(&self, _event: SessionEvent) {}
}

/// Logging emitter for debugging and development.
///
/// Logs metadata at info level and session events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_metadata(&self, metadata: TrackMetadata) {
        tracing::info!(title = %metadata.title, stream_url = %metadata.stream_url, "now_playing");
    }

    fn emit_session(&self, event: SessionEvent) {
        tracing::debug!(?event, "session_event");
    }
}

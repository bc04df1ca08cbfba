//! Bridge implementation that maps proxy events to a broadcast channel.
//!
//! The [`BroadcastEventBridge`] lives at the boundary between the proxy and
//! the application, turning emitter calls into [`ProxyEvent`]s that any
//! number of subscribers can receive.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::{ProxyEvent, SessionEvent, TrackMetadata};

/// Bridges proxy events to a `tokio::sync::broadcast` channel.
///
/// An optional external emitter (e.g. a UI callback) receives every event
/// first; it can be set after construction.
///
/// Sending never blocks: a subscriber that falls behind by more than the
/// channel capacity observes `RecvError::Lagged` and misses old events.
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<ProxyEvent>,
    external_emitter: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets an external emitter that receives events before the channel.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.external_emitter.write() = Some(emitter);
    }

    /// Returns a new receiver for the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: ProxyEvent) {
        if let Err(e) = self.tx.send(event) {
            log::trace!("[EventBridge] No broadcast receivers: {}", e);
        }
    }
}

impl EventEmitter for BroadcastEventBridge {
    fn emit_metadata(&self, metadata: TrackMetadata) {
        if let Some(ref emitter) = *self.external_emitter.read() {
            emitter.emit_metadata(metadata.clone());
        }
        self.send(ProxyEvent::Metadata(metadata));
    }

    fn emit_session(&self, event: SessionEvent) {
        if let Some(ref emitter) = *self.external_emitter.read() {
            emitter.emit_session(event.clone());
        }
        self.send(ProxyEvent::Session(event));
    }
}

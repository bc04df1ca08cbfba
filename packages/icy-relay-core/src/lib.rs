//! ICY Relay Core - metadata-stripping proxy for Shoutcast/Icecast streams.
//!
//! Audio decoders that do not understand ICY metadata cannot play streams
//! with interleaved "now playing" blocks. This crate sits between such a
//! decoder and the stream server: it requests metadata upstream, removes the
//! blocks from the byte stream and reports their contents as events.
//!
//! # Architecture
//!
//! - [`proxy`]: The [`IcyStreamProxy`] front end and per-connection session
//! - [`stream`]: ICY header handling and the metadata demuxer
//! - [`events`]: Metadata and session events, emitters and broadcast bridge
//! - [`endpoint`]: Remote URL parsing and local URL building
//! - [`config`]: Proxy tunables
//! - [`runtime`]: Task spawning abstraction for async runtime independence
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): Spawning the session task
//! - [`EventEmitter`](events::EventEmitter): Receiving metadata and lifecycle events
//!
//! Both have default implementations suitable for the standalone binary.

#![warn(clippy::all)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod protocol_constants;
pub mod proxy;
pub mod runtime;
pub mod stream;
pub mod utils;

// Re-export commonly used types at the crate root
pub use config::ProxyConfig;
pub use endpoint::{Endpoint, UrlBuilder};
pub use error::{ErrorCode, ProxyError, ProxyResult};
pub use events::{
    BroadcastEventBridge, EventEmitter, LoggingEventEmitter, NoopEventEmitter, ProxyEvent,
    SessionEvent, StationInfo, TrackMetadata,
};
pub use proxy::{IcyStreamProxy, ProxyHandle, ProxySession, SessionState, SessionSummary};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use stream::{IcyDemuxer, IcyFormatter, MetaInterval};
pub use utils::now_millis;

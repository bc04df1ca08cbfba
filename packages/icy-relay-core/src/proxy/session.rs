//! Per-connection proxy session.
//!
//! A [`ProxySession`] owns one remote and one local connection and drives
//! them through the handshake and the reframing loop:
//!
//! ```text
//! Connecting → AwaitingClientRequest → AwaitingRemoteHeaders → Streaming → Closed | Error
//! ```
//!
//! `Connecting` is reported by [`IcyStreamProxy`](super::IcyStreamProxy)
//! while the remote connection is being established.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::endpoint::Endpoint;
use crate::error::{ErrorCode, ProxyError, ProxyResult};
use crate::events::{EventEmitter, SessionEvent, StationInfo, TrackMetadata};
use crate::stream::{find_header_end, ClientRequest, IcyDemuxer, MetaInterval, ResponseHeaders};
use crate::utils::{now_millis, preview};

/// Size of the buffer used to watch the local client for disconnects.
const CLIENT_WATCH_SIZE: usize = 512;

/// Grace period for flushing the local connection on teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// States of a proxy session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Remote TCP connect in flight.
    Connecting,
    /// Waiting for the local client's HTTP request.
    AwaitingClientRequest,
    /// Request forwarded, collecting the remote response headers.
    AwaitingRemoteHeaders,
    /// Relaying audio and extracting metadata.
    Streaming,
    /// Either side closed the connection.
    Closed,
    /// The session failed.
    Error,
}

impl SessionState {
    /// Returns true for `Closed` and `Error`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// Outcome of a session that ended without error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Audio bytes written to the local client (headers excluded).
    pub bytes_forwarded: u64,
    /// Non-empty metadata blocks stripped from the stream.
    pub metadata_blocks: u64,
    pub meta_interval: MetaInterval,
    pub station: StationInfo,
    /// Most recent metadata seen, if any.
    pub last_metadata: Option<TrackMetadata>,
}

impl SessionSummary {
    /// Summary of a session that never received a client.
    pub(crate) fn empty() -> Self {
        Self {
            bytes_forwarded: 0,
            metadata_blocks: 0,
            meta_interval: MetaInterval::Unknown,
            station: StationInfo::default(),
            last_metadata: None,
        }
    }
}

/// One end-to-end relay between an upstream server and a local client.
///
/// Generic over the connection types so it can run over TCP sockets as well
/// as in-memory pipes. All mutable state is owned by the task running
/// [`run`](Self::run); nothing is shared.
pub struct ProxySession {
    endpoint: Endpoint,
    config: ProxyConfig,
    emitter: Arc<dyn EventEmitter>,
    cancel: CancellationToken,
    state: SessionState,
    meta_interval: MetaInterval,
    demuxer: IcyDemuxer,
    station: StationInfo,
    last_metadata: Option<TrackMetadata>,
    bytes_forwarded: u64,
}

impl ProxySession {
    /// Creates a session for an already connected remote.
    pub fn new(
        endpoint: Endpoint,
        config: ProxyConfig,
        emitter: Arc<dyn EventEmitter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            endpoint,
            config,
            emitter,
            cancel,
            state: SessionState::Connecting,
            meta_interval: MetaInterval::Unknown,
            demuxer: IcyDemuxer::new(MetaInterval::Unknown),
            station: StationInfo::default(),
            last_metadata: None,
            bytes_forwarded: 0,
        }
    }

    /// Current state of the state machine.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once the response header block has been consumed.
    pub fn header_parsed(&self) -> bool {
        self.meta_interval != MetaInterval::Unknown
    }

    /// Runs the session until either side closes, an error occurs or the
    /// cancellation token fires.
    ///
    /// The outcome is reported exactly once through
    /// [`SessionEvent::Ended`] and returned.
    pub async fn run<R, L>(mut self, mut remote: R, mut local: L) -> ProxyResult<SessionSummary>
    where
        R: AsyncRead + AsyncWrite + Unpin,
        L: AsyncRead + AsyncWrite + Unpin,
    {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            result = self.drive(&mut remote, &mut local) => result,
            _ = cancel.cancelled() => {
                log::info!("[Session] Cancelled in state {:?}", self.state);
                Ok(())
            }
        };

        // Pending buffered data is discarded; only the FIN is attempted.
        let _ = timeout(SHUTDOWN_GRACE, local.shutdown()).await;
        let _ = timeout(SHUTDOWN_GRACE, remote.shutdown()).await;

        let summary = self.summary();
        match &result {
            Ok(()) => {
                log::info!(
                    "[Session] Closed after {} bytes ({} metadata blocks)",
                    summary.bytes_forwarded,
                    summary.metadata_blocks
                );
                self.set_state(SessionState::Closed);
            }
            Err(e) => {
                log::warn!("[Session] Ended with error: {}", e);
                self.set_state(SessionState::Error);
            }
        }

        self.emitter.emit_session(SessionEvent::Ended {
            bytes_forwarded: summary.bytes_forwarded,
            metadata_blocks: summary.metadata_blocks,
            error_code: result.as_ref().err().map(|e| e.code()),
            error: result.as_ref().err().map(|e| e.to_string()),
            timestamp: now_millis(),
        });

        result.map(|()| summary)
    }

    async fn drive<R, L>(&mut self, remote: &mut R, local: &mut L) -> ProxyResult<()>
    where
        R: AsyncRead + AsyncWrite + Unpin,
        L: AsyncRead + AsyncWrite + Unpin,
    {
        self.set_state(SessionState::AwaitingClientRequest);
        let request = self.read_client_request(local).await?;
        log::debug!("[Session] Client requested {}", request.path());

        let upstream = request.to_upstream(&self.endpoint);
        log::trace!("[Session] Upstream request: {}", preview(&upstream, 256));
        write_remote(remote, &upstream, self.config.write_timeout()).await?;

        self.set_state(SessionState::AwaitingRemoteHeaders);
        let payload = self.read_response_headers(remote, local).await?;

        self.set_state(SessionState::Streaming);
        if !payload.is_empty() && !self.relay_chunk(&payload, local).await? {
            return Ok(());
        }
        self.stream(remote, local).await
    }

    /// Reads the local client's request header block.
    async fn read_client_request<L>(&mut self, local: &mut L) -> ProxyResult<ClientRequest>
    where
        L: AsyncRead + Unpin,
    {
        let max = self.config.max_header_bytes;
        let read = async {
            let mut buf = BytesMut::with_capacity(1024);
            loop {
                if let Some(end) = find_header_end(&buf) {
                    if end < buf.len() {
                        log::debug!(
                            "[Session] Ignoring {} bytes after client request",
                            buf.len() - end
                        );
                    }
                    return ClientRequest::parse(&buf[..end]);
                }
                if buf.len() > max {
                    return Err(ProxyError::protocol(format!(
                        "client request exceeds {} bytes",
                        max
                    )));
                }
                if local.read_buf(&mut buf).await? == 0 {
                    return Err(ProxyError::protocol(
                        "client closed before completing its request",
                    ));
                }
            }
        };

        timeout(self.config.request_timeout(), read)
            .await
            .map_err(|_| ProxyError::protocol("timed out waiting for client request"))?
    }

    /// Collects the remote header block, forwards it to the local client and
    /// returns any payload bytes that arrived with it.
    async fn read_response_headers<R, L>(
        &mut self,
        remote: &mut R,
        local: &mut L,
    ) -> ProxyResult<BytesMut>
    where
        R: AsyncRead + Unpin,
        L: AsyncWrite + Unpin,
    {
        let max = self.config.max_header_bytes;
        let mut buf = BytesMut::with_capacity(self.config.read_chunk_size);

        let end = loop {
            if let Some(end) = find_header_end(&buf) {
                break end;
            }
            if buf.len() > max {
                return Err(ProxyError::protocol(format!(
                    "response headers exceed {} bytes",
                    max
                )));
            }
            let n = timeout(self.config.idle_timeout(), remote.read_buf(&mut buf))
                .await
                .map_err(|_| ProxyError::timed_out("waiting for response headers"))??;
            if n == 0 {
                return Err(ProxyError::protocol(
                    "stream server closed before sending headers",
                ));
            }
        };

        let header_block = buf.split_to(end);
        let headers = ResponseHeaders::parse(&header_block)?;
        log::debug!(
            "[Session] Response headers: status={:?} metaint={}",
            headers.status,
            headers.meta_interval.as_signed()
        );

        self.meta_interval = headers.meta_interval;
        self.demuxer = IcyDemuxer::new(headers.meta_interval);
        self.station = headers.station.clone();

        self.emitter.emit_session(SessionEvent::HeadersReceived {
            meta_int: headers.meta_interval.bytes(),
            station: headers.station,
            timestamp: now_millis(),
        });
        if headers.meta_interval == MetaInterval::Absent {
            log::info!("[Session] No icy-metaint from server, relaying audio without metadata");
            self.emitter.emit_session(SessionEvent::NoMetadata {
                timestamp: now_millis(),
            });
        }

        write_local(local, &headers.forwarded, self.config.write_timeout()).await?;
        Ok(buf)
    }

    /// Steady-state reframing loop.
    async fn stream<R, L>(&mut self, remote: &mut R, local: &mut L) -> ProxyResult<()>
    where
        R: AsyncRead + Unpin,
        L: AsyncRead + AsyncWrite + Unpin,
    {
        let idle = self.config.idle_timeout();
        let mut buf = vec![0u8; self.config.read_chunk_size];
        let mut client_buf = [0u8; CLIENT_WATCH_SIZE];

        loop {
            tokio::select! {
                read = timeout(idle, remote.read(&mut buf)) => {
                    let n = read.map_err(|_| ProxyError::timed_out("remote read"))??;
                    if n == 0 {
                        log::info!("[Session] Stream server closed the connection");
                        return Ok(());
                    }
                    // Remote is not read again until this chunk is written.
                    if !self.relay_chunk(&buf[..n], local).await? {
                        return Ok(());
                    }
                }
                read = local.read(&mut client_buf) => {
                    match read {
                        Ok(0) => {
                            log::info!("[Session] Local client disconnected");
                            return Ok(());
                        }
                        Ok(n) => log::trace!("[Session] Ignoring {} bytes from client", n),
                        Err(e) if is_disconnect(&e) => {
                            log::info!("[Session] Local client went away: {}", e);
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Demuxes one chunk, notifies metadata, then writes the audio.
    ///
    /// Returns `false` when the local client has gone away.
    async fn relay_chunk<L>(&mut self, chunk: &[u8], local: &mut L) -> ProxyResult<bool>
    where
        L: AsyncWrite + Unpin,
    {
        let demuxed = self.demuxer.feed(chunk);

        for metadata in demuxed.metadata {
            self.notify_metadata(metadata);
        }

        if demuxed.audio.is_empty() {
            return Ok(true);
        }
        match write_local(local, &demuxed.audio, self.config.write_timeout()).await {
            Ok(()) => {
                self.bytes_forwarded += demuxed.audio.len() as u64;
                Ok(true)
            }
            Err(ProxyError::Io(e)) if is_disconnect(&e) => {
                log::info!("[Session] Local client went away: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn notify_metadata(&mut self, metadata: TrackMetadata) {
        if !self.config.emit_duplicate_metadata && self.last_metadata.as_ref() == Some(&metadata) {
            log::trace!("[Session] Unchanged metadata '{}'", metadata.title);
            return;
        }
        log::info!(
            "[Session] Now playing: '{}' {}",
            metadata.title,
            metadata.stream_url
        );
        self.last_metadata = Some(metadata.clone());
        self.emitter.emit_metadata(metadata);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        log::debug!("[Session] {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emitter.emit_session(SessionEvent::StateChanged {
            state,
            timestamp: now_millis(),
        });
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            bytes_forwarded: self.bytes_forwarded,
            metadata_blocks: self.demuxer.metadata_blocks(),
            meta_interval: self.meta_interval,
            station: self.station.clone(),
            last_metadata: self.last_metadata.clone(),
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

async fn write_local<L>(local: &mut L, data: &[u8], limit: Duration) -> ProxyResult<()>
where
    L: AsyncWrite + Unpin,
{
    timeout(limit, local.write_all(data))
        .await
        .map_err(|_| ProxyError::timed_out("local write"))??;
    Ok(())
}

async fn write_remote<R>(remote: &mut R, data: &[u8], limit: Duration) -> ProxyResult<()>
where
    R: AsyncWrite + Unpin,
{
    timeout(limit, async {
        remote.write_all(data).await?;
        remote.flush().await
    })
    .await
    .map_err(|_| ProxyError::timed_out("remote write"))??;
    Ok(())
}

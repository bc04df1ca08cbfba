//! The ICY stream proxy.
//!
//! [`IcyStreamProxy`] connects to the remote stream server, binds a local
//! listener on the loopback interface and relays exactly one client session
//! through a [`ProxySession`].

mod session;

pub use session::{ProxySession, SessionState, SessionSummary};

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::endpoint::{Endpoint, UrlBuilder};
use crate::error::{ErrorCode, ProxyError, ProxyResult};
use crate::events::{EventEmitter, SessionEvent};
use crate::protocol_constants::BUSY_RESPONSE;
use crate::runtime::TaskSpawner;
use crate::utils::now_millis;

/// Pause after a failed `accept()` while a session is running.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Sockets held between construction and the first client.
struct Ready {
    endpoint: Endpoint,
    remote: TcpStream,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Single-session metadata-stripping proxy for one ICY stream.
///
/// Construction performs all network setup. When it fails the proxy stays
/// usable as a pass-through: [`proxy_url`](Self::proxy_url) then returns the
/// remote URL so the caller can play the stream without metadata.
pub struct IcyStreamProxy {
    remote_url: String,
    config: ProxyConfig,
    emitter: Arc<dyn EventEmitter>,
    cancel: CancellationToken,
    inner: Result<Ready, ProxyError>,
}

impl IcyStreamProxy {
    /// Connects to `url` and binds the local listener.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::Configuration`] if `config` fails validation
    /// - [`ProxyError::Protocol`] if `url` is malformed or not `http`
    /// - [`ProxyError::Connect`] if the remote cannot be reached in time
    /// - [`ProxyError::Bind`] if no candidate port could be bound
    pub async fn try_open(
        url: &str,
        config: ProxyConfig,
        emitter: Arc<dyn EventEmitter>,
    ) -> ProxyResult<Self> {
        let ready = Self::setup(url, &config, emitter.as_ref()).await?;
        Ok(Self {
            remote_url: url.to_string(),
            config,
            emitter,
            cancel: CancellationToken::new(),
            inner: Ok(ready),
        })
    }

    /// Like [`try_open`](Self::try_open) but never fails.
    ///
    /// On error the proxy is unavailable: [`is_available`](Self::is_available)
    /// returns `false` and [`init_error`](Self::init_error) holds the cause.
    pub async fn open(url: &str, config: ProxyConfig, emitter: Arc<dyn EventEmitter>) -> Self {
        let inner = Self::setup(url, &config, emitter.as_ref()).await;
        if let Err(ref e) = inner {
            log::warn!("[Proxy] Unavailable, falling back to {}: {}", url, e);
        }
        Self {
            remote_url: url.to_string(),
            config,
            emitter,
            cancel: CancellationToken::new(),
            inner,
        }
    }

    async fn setup(
        url: &str,
        config: &ProxyConfig,
        emitter: &dyn EventEmitter,
    ) -> ProxyResult<Ready> {
        let result = Self::connect_and_bind(url, config, emitter).await;
        if let Err(ref e) = result {
            emit_terminal(emitter, Some(e));
        }
        result
    }

    async fn connect_and_bind(
        url: &str,
        config: &ProxyConfig,
        emitter: &dyn EventEmitter,
    ) -> ProxyResult<Ready> {
        config.validate().map_err(ProxyError::Configuration)?;
        let endpoint = Endpoint::parse(url)?;

        emitter.emit_session(SessionEvent::StateChanged {
            state: SessionState::Connecting,
            timestamp: now_millis(),
        });

        let remote = connect_remote(&endpoint, config).await?;
        let listener = bind_local(config).await?;
        let local_addr = listener.local_addr()?;

        log::info!(
            "[Proxy] Relaying {} via http://{}",
            endpoint.url(),
            local_addr
        );

        Ok(Ready {
            endpoint,
            remote,
            listener,
            local_addr,
        })
    }

    /// Returns true if the local endpoint is ready for a client.
    pub fn is_available(&self) -> bool {
        self.inner.is_ok()
    }

    /// The error that made the proxy unavailable, if any.
    pub fn init_error(&self) -> Option<&ProxyError> {
        self.inner.as_ref().err()
    }

    /// URL the decoder should open.
    ///
    /// The local endpoint when available, otherwise the remote URL.
    pub fn proxy_url(&self) -> String {
        match &self.inner {
            Ok(ready) => UrlBuilder::new(ready.local_addr).proxy_url(ready.endpoint.path()),
            Err(_) => self.remote_url.clone(),
        }
    }

    /// Address of the bound listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.as_ref().ok().map(|ready| ready.local_addr)
    }

    /// Token that ends the session (or the wait for a client) when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the local client and relays the stream until the session
    /// ends.
    ///
    /// # Errors
    ///
    /// Returns the init error when unavailable, a timeout if no client
    /// arrives within `accept_timeout`, or the session's error.
    pub async fn run(self) -> ProxyResult<SessionSummary> {
        let Self {
            config,
            emitter,
            cancel,
            inner,
            ..
        } = self;
        let Ready {
            endpoint,
            remote,
            listener,
            ..
        } = inner?;

        let (local, peer) = tokio::select! {
            accepted = accept_client(&listener, config.accept_timeout()) => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("[Proxy] No client: {}", e);
                    emit_terminal(emitter.as_ref(), Some(&e));
                    return Err(e);
                }
            },
            _ = cancel.cancelled() => {
                log::info!("[Proxy] Cancelled before a client connected");
                emit_terminal(emitter.as_ref(), None);
                return Ok(SessionSummary::empty());
            }
        };

        log::info!("[Proxy] Client connected from {}", peer);
        emitter.emit_session(SessionEvent::ClientConnected {
            peer: peer.to_string(),
            timestamp: now_millis(),
        });
        if let Err(e) = local.set_nodelay(true) {
            log::debug!("[Proxy] Could not set TCP_NODELAY: {}", e);
        }

        let session = ProxySession::new(endpoint, config, emitter.clone(), cancel);
        tokio::select! {
            result = session.run(remote, local) => result,
            never = reject_further_clients(|| listener.accept(), emitter.as_ref()) => match never {},
        }
    }

    /// Runs the proxy on `spawner` and returns a handle to it.
    pub fn spawn<S: TaskSpawner>(self, spawner: &S) -> ProxyHandle {
        let cancel = self.cancel.clone();
        let (tx, rx) = oneshot::channel();
        spawner.spawn(async move {
            let result = self.run().await;
            if tx.send(result).is_err() {
                log::debug!("[Proxy] Session result dropped, handle was released");
            }
        });
        ProxyHandle { cancel, rx }
    }
}

/// Handle to a proxy running on a [`TaskSpawner`].
pub struct ProxyHandle {
    cancel: CancellationToken,
    rx: oneshot::Receiver<ProxyResult<SessionSummary>>,
}

impl ProxyHandle {
    /// Requests the session to end. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the session to finish.
    pub async fn wait(self) -> ProxyResult<SessionSummary> {
        self.rx.await.map_err(|_| {
            ProxyError::Io(io::Error::other("proxy task ended without a result"))
        })?
    }
}

async fn connect_remote(endpoint: &Endpoint, config: &ProxyConfig) -> ProxyResult<TcpStream> {
    let addr = endpoint.connect_addr();
    log::debug!("[Proxy] Connecting to {}", addr);

    let stream = match timeout(config.connect_timeout(), TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(ProxyError::Connect {
                endpoint: addr,
                source,
            })
        }
        Err(_) => {
            return Err(ProxyError::Connect {
                endpoint: addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("[Proxy] Could not set TCP_NODELAY: {}", e);
    }
    Ok(stream)
}

/// Binds the first free candidate port on the loopback interface.
async fn bind_local(config: &ProxyConfig) -> ProxyResult<TcpListener> {
    let mut last_error = None;
    for port in config.candidate_ports() {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                log::debug!("[Proxy] Port {} unavailable: {}", port, e);
                last_error = Some(e);
            }
        }
    }
    Err(ProxyError::Bind {
        port: config.port,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate ports")),
    })
}

async fn accept_client(
    listener: &TcpListener,
    limit: Option<Duration>,
) -> ProxyResult<(TcpStream, SocketAddr)> {
    match limit {
        Some(limit) => timeout(limit, listener.accept())
            .await
            .map_err(|_| ProxyError::timed_out("waiting for local client"))?
            .map_err(ProxyError::from),
        None => listener.accept().await.map_err(ProxyError::from),
    }
}

/// Reports the end of a proxy that never started a session.
fn emit_terminal(emitter: &dyn EventEmitter, error: Option<&ProxyError>) {
    let state = if error.is_some() {
        SessionState::Error
    } else {
        SessionState::Closed
    };
    emitter.emit_session(SessionEvent::StateChanged {
        state,
        timestamp: now_millis(),
    });
    emitter.emit_session(SessionEvent::Ended {
        bytes_forwarded: 0,
        metadata_blocks: 0,
        error_code: error.map(|e| e.code()),
        error: error.map(|e| e.to_string()),
        timestamp: now_millis(),
    });
}

/// Turns away every client after the first one.
///
/// Accept errors (e.g. descriptor exhaustion) are retried after
/// [`ACCEPT_ERROR_BACKOFF`].
async fn reject_further_clients<A, F>(mut accept: A, emitter: &dyn EventEmitter) -> Infallible
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let (mut stream, peer) = match accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("[Proxy] Accept failed while busy: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        log::warn!("[Proxy] Rejecting extra client {}", peer);
        if let Err(e) = stream.write_all(BUSY_RESPONSE).await {
            log::debug!("[Proxy] Failed to send busy response to {}: {}", peer, e);
        }
        let _ = stream.shutdown().await;
        emitter.emit_session(SessionEvent::ClientRejected {
            peer: peer.to_string(),
            timestamp: now_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BroadcastEventBridge, NoopEventEmitter, ProxyEvent};
    use crate::runtime::TokioSpawner;
    use crate::stream::find_header_end;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            port: 0,
            ..Default::default()
        }
    }

    /// Minimal ICY server: answers one request with `response`, then holds
    /// the connection until `release` fires.
    async fn fake_server(response: Vec<u8>) -> (String, oneshot::Sender<()>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let url = format!("http://{}/stream", listener.local_addr().unwrap());
        let (release, released) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            while find_header_end(&request).is_none() {
                let mut chunk = [0u8; 256];
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(&response).await.unwrap();
            let _ = released.await;
        });
        (url, release)
    }

    /// Drains the session events received so far.
    fn session_events(rx: &mut tokio::sync::broadcast::Receiver<ProxyEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProxyEvent::Session(event) = event {
                events.push(event);
            }
        }
        events
    }

    /// Asserts that the last two events are `Error` followed by `Ended` with `code`.
    fn assert_failed_with(events: &[SessionEvent], code: &str) {
        match events {
            [.., SessionEvent::StateChanged { state, .. }, SessionEvent::Ended { error_code, .. }] => {
                assert_eq!(*state, SessionState::Error);
                assert_eq!(*error_code, Some(code));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    fn icy_response() -> Vec<u8> {
        let mut response = b"ICY 200 OK\r\nicy-name: Test FM\r\nicy-metaint: 10\r\n\r\n".to_vec();
        response.extend_from_slice(b"AAAAAAAAAA");
        response.push(1);
        response.extend_from_slice(b"StreamTitle='X';");
        response.extend_from_slice(b"BBBBBBBBBB");
        response
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        // Bind then drop to obtain a port with nothing listening.
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/", port);
        let bridge = BroadcastEventBridge::new(16);
        let mut rx = bridge.subscribe();

        let err = IcyStreamProxy::try_open(&url, test_config(), Arc::new(bridge))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Connect { .. }));
        assert!(err.is_fatal_to_proxy());

        let events = session_events(&mut rx);
        assert!(matches!(
            events.first(),
            Some(SessionEvent::StateChanged {
                state: SessionState::Connecting,
                ..
            })
        ));
        assert_failed_with(&events, "connect_failed");
    }

    #[tokio::test]
    async fn unsupported_url_is_protocol_error() {
        let err = IcyStreamProxy::try_open("ftp://example.com/", test_config(), Arc::new(NoopEventEmitter))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = ProxyConfig {
            read_chunk_size: 0,
            ..test_config()
        };
        let err = IcyStreamProxy::try_open("http://127.0.0.1:1/", config, Arc::new(NoopEventEmitter))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Configuration(_)));
    }

    #[tokio::test]
    async fn occupied_port_is_bind_error() {
        let (url, _release) = fake_server(Vec::new()).await;
        let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let config = ProxyConfig {
            port: occupied.local_addr().unwrap().port(),
            port_retry_count: 0,
            ..Default::default()
        };

        let err = IcyStreamProxy::try_open(&url, config, Arc::new(NoopEventEmitter))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }

    #[tokio::test]
    async fn unavailable_proxy_falls_back_to_remote_url() {
        let proxy = IcyStreamProxy::open("http://127.0.0.1:1/live", test_config(), Arc::new(NoopEventEmitter)).await;
        assert!(!proxy.is_available());
        assert!(proxy.init_error().is_some());
        assert_eq!(proxy.proxy_url(), "http://127.0.0.1:1/live");
        assert_eq!(proxy.local_addr(), None);
        assert!(proxy.run().await.is_err());
    }

    #[tokio::test]
    async fn relays_one_client_end_to_end() {
        let (url, release) = fake_server(icy_response()).await;
        let bridge = BroadcastEventBridge::new(64);
        let mut events = bridge.subscribe();

        let proxy = IcyStreamProxy::try_open(&url, test_config(), Arc::new(bridge.clone()))
            .await
            .unwrap();
        assert!(proxy.is_available());
        let local_addr = proxy.local_addr().unwrap();
        assert_eq!(proxy.proxy_url(), format!("http://{}/stream", local_addr));

        let handle = proxy.spawn(&TokioSpawner::current());

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client
            .write_all(b"GET /stream HTTP/1.0\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let expected = b"ICY 200 OK\r\nicy-name: Test FM\r\n\r\nAAAAAAAAAABBBBBBBBBB";
        let mut received = vec![0u8; expected.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], &expected[..]);

        release.send(()).unwrap();
        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.bytes_forwarded, 20);
        assert_eq!(summary.station.name.as_deref(), Some("Test FM"));

        let mut titles = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ProxyEvent::Metadata(m) = event {
                titles.push(m.title);
            }
        }
        assert_eq!(titles, vec!["X".to_string()]);
    }

    #[tokio::test]
    async fn second_client_is_turned_away() {
        let (url, _release) = fake_server(b"ICY 200 OK\r\n\r\n".to_vec()).await;
        let proxy = IcyStreamProxy::try_open(&url, test_config(), Arc::new(NoopEventEmitter))
            .await
            .unwrap();
        let local_addr = proxy.local_addr().unwrap();
        let handle = proxy.spawn(&TokioSpawner::current());

        let mut first = TcpStream::connect(local_addr).await.unwrap();
        first.write_all(b"GET /stream HTTP/1.0\r\n\r\n").await.unwrap();
        let mut headers = vec![0u8; b"ICY 200 OK\r\n\r\n".len()];
        first.read_exact(&mut headers).await.unwrap();

        let mut second = TcpStream::connect(local_addr).await.unwrap();
        let mut reply = Vec::new();
        second.read_to_end(&mut reply).await.unwrap();
        assert_eq!(&reply[..], BUSY_RESPONSE);

        handle.cancel();
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn cancel_before_client_connects() {
        let (url, _release) = fake_server(Vec::new()).await;
        let proxy = IcyStreamProxy::try_open(&url, test_config(), Arc::new(NoopEventEmitter))
            .await
            .unwrap();
        let token = proxy.cancellation_token();
        let task = tokio::spawn(proxy.run());

        token.cancel();
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.bytes_forwarded, 0);
    }

    #[tokio::test]
    async fn accept_timeout_expires() {
        let (url, _release) = fake_server(Vec::new()).await;
        let config = ProxyConfig {
            accept_timeout_secs: 1,
            ..test_config()
        };
        let bridge = BroadcastEventBridge::new(16);
        let mut rx = bridge.subscribe();
        let proxy = IcyStreamProxy::try_open(&url, config, Arc::new(bridge))
            .await
            .unwrap();

        let err = proxy.run().await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
        assert_failed_with(&session_events(&mut rx), "io_error");
    }

    #[tokio::test(start_paused = true)]
    async fn accept_errors_are_retried_with_backoff() {
        let attempts = AtomicUsize::new(0);
        let rejecting = reject_further_clients(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<(TcpStream, SocketAddr), _>(io::Error::other(
                    "too many open files",
                )))
            },
            &NoopEventEmitter,
        );

        assert!(timeout(Duration::from_secs(1), rejecting).await.is_err());
        let attempts = attempts.load(Ordering::SeqCst);
        assert!((5..=11).contains(&attempts), "attempts={attempts}");
    }
}

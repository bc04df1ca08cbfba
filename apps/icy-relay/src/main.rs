//! ICY Relay - standalone metadata-stripping proxy for ICY streams.
//!
//! Connects to a Shoutcast/Icecast stream, prints a local URL for a decoder
//! that cannot handle interleaved metadata, and reports "now playing"
//! changes on stdout while relaying the audio.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use icy_relay_core::protocol_constants::EVENT_CHANNEL_CAPACITY;
use icy_relay_core::{
    BroadcastEventBridge, IcyStreamProxy, LoggingEventEmitter, ProxyEvent, TokioSpawner,
};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;

/// ICY Relay - strip ICY metadata from a stream for a local decoder.
#[derive(Parser, Debug)]
#[command(name = "icy-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stream URL (http only).
    url: String,

    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ICY_RELAY_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Local port (overrides config file).
    #[arg(short = 'p', long, env = "ICY_RELAY_PORT")]
    port: Option<u16>,

    /// Print events as JSON lines on stdout.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine-readable
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("ICY Relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    log::info!(
        "Configuration: port={}, idle_timeout={}s",
        config.port,
        config.idle_timeout_secs
    );

    let bridge = BroadcastEventBridge::new(EVENT_CHANNEL_CAPACITY);
    bridge.set_external_emitter(Arc::new(LoggingEventEmitter));
    let printer = spawn_event_printer(bridge.subscribe(), args.json);

    let proxy =
        IcyStreamProxy::open(&args.url, config.to_proxy_config(), Arc::new(bridge.clone())).await;
    // The proxy now holds the only sender, so the printer ends with the session.
    drop(bridge);

    if let Some(e) = proxy.init_error() {
        log::warn!("Proxy unavailable ({}), play the stream directly", e);
        println!("{}", proxy.proxy_url());
        drop(proxy);
        let _ = printer.await;
        return Ok(());
    }

    println!("{}", proxy.proxy_url());

    let cancel = proxy.cancellation_token();
    let wait = proxy.spawn(&TokioSpawner::current()).wait();
    tokio::pin!(wait);

    let result = tokio::select! {
        result = &mut wait => result,
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, ending session...");
            cancel.cancel();
            wait.await
        }
    };

    if let Err(e) = printer.await {
        log::debug!("Event printer ended abnormally: {}", e);
    }

    let summary = result.context("Stream session failed")?;
    log::info!(
        "Session complete: {} audio bytes, {} metadata blocks",
        summary.bytes_forwarded,
        summary.metadata_blocks
    );
    Ok(())
}

/// Prints events until the last sender is dropped.
fn spawn_event_printer(mut rx: broadcast::Receiver<ProxyEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event, json),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Event printer lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &ProxyEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => log::error!("Failed to serialize event: {}", e),
        }
        return;
    }

    match event {
        ProxyEvent::Metadata(metadata) if !metadata.stream_url.is_empty() => {
            println!("Now playing: {} ({})", metadata.title, metadata.stream_url);
        }
        ProxyEvent::Metadata(metadata) => println!("Now playing: {}", metadata.title),
        ProxyEvent::Session(_) => {}
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

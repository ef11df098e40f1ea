mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

use ws_relay::{InMemoryRegistry, Proxy, ProxyConfig, SessionRegistry, UpstreamConfig};

use crate::cli::Cli;
use crate::config::ConfigSource;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI / environment overrides.
    let (mut cfg, source) = config::load(&cli.config)?;

    if let Some(ref host) = cli.host {
        cfg.network.host = host.clone();
    }
    if let Some(port) = cli.port {
        cfg.network.port = port;
    }
    if let Some(ref upstream) = cli.upstream {
        cfg.upstream.uri = upstream.clone();
    }
    if let Some(secs) = cli.connect_timeout {
        cfg.upstream.connect_timeout_secs = secs;
    }
    if let Some(ref level) = cli.log_level {
        cfg.logging.level = level.clone();
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    if source == ConfigSource::Defaults {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; using defaults"
        );
    }

    // 4. Outbound wss:// uses rustls; pick the ring provider explicitly.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a rustls crypto provider was already installed");
    }

    info!(
        config_file = %cli.config.display(),
        host = %cfg.network.host,
        port = cfg.network.port,
        upstream = %cfg.upstream.uri,
        connect_timeout_secs = cfg.upstream.connect_timeout_secs,
        "realtime-proxy starting"
    );

    // 5. Set up shutdown signal (ctrl_c + SIGTERM).
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    // 6. Create the relay.
    let registry = Arc::new(InMemoryRegistry::new());
    let proxy_config = ProxyConfig {
        listen_host: cfg.network.host.clone(),
        listen_port: cfg.network.port,
        upstream: UpstreamConfig {
            uri: cfg.upstream.uri.clone(),
            content_type: cfg.upstream.content_type.clone(),
            connect_timeout: cfg.connect_timeout(),
        },
        handshake_timeout: cfg.handshake_timeout(),
        registry: registry.clone(),
    };
    let proxy = Proxy::new(proxy_config);
    let listener = proxy.bind().await.context("failed to start relay listener")?;

    info!(
        "connect to: ws://{}:{}/realtime?api_key=YOUR_API_KEY",
        cfg.network.host, cfg.network.port
    );

    // 7. Serve until a shutdown signal arrives.
    proxy
        .serve(listener, async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    // 8. Log shutdown.
    let snapshot = registry.snapshot();
    info!(
        active_sessions = snapshot.active(),
        session_ids = ?snapshot.ids(),
        "realtime-proxy shutting down"
    );

    Ok(())
}

/// Resolve on SIGINT (ctrl-c) or, on Unix, SIGTERM.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        info!("received SIGINT (ctrl-c)");
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM");
                    }
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler; only ctrl-c will stop the relay");
                ctrl_c.await.ok();
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT (ctrl-c)");
    }
}

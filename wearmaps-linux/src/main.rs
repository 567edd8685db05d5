// WearMaps Linux host: peer transport, tile fetcher, location feed and relay loop.

mod config;
mod fetcher;
mod launcher;
mod location;
mod relay;
mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wearmaps_core::{Keypair, LocationSample, RelayConfig, RelayCore, StaticMapSource};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("wearmaps-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let keypair = Arc::new(Keypair::generate());
    info!(device = %keypair.device_id(), port = cfg.transport_port, "starting");

    let source = StaticMapSource::new(cfg.map_base_url.clone(), cfg.map_api_key.clone());
    let fetcher = Arc::new(
        fetcher::HttpTileFetcher::new(source, cfg.fetch_timeout_secs)
            .context("building HTTP client")?,
    );
    info!(map = %fetcher.source().base_url(), timeout = cfg.fetch_timeout_secs, "tile source");
    let feed = Arc::new(location::FeedLocation::new(
        cfg.fixed_position()
            .map(|(lat, lon)| LocationSample::new(lat, lon)),
    ));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.transport_port))
            .await
            .with_context(|| format!("binding transport port {}", cfg.transport_port))?;

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let senders: transport::PeerSenders = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut core = RelayCore::with_shared_keypair(
            keypair.clone(),
            RelayConfig {
                report_fetch_failures: cfg.report_fetch_failures,
                ..RelayConfig::default()
            },
        );
        core.on_connecting();
        let relay = relay::Relay::new(
            core,
            fetcher,
            feed.clone(),
            launcher::Launcher::new(cfg.ui_command.clone()),
            senders.clone(),
            events_tx.clone(),
        );
        tokio::spawn(relay.run(events_rx));

        let display_name = cfg.display_name.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::run_transport(
                listener,
                keypair,
                display_name,
                senders,
                events_tx,
            )
            .await
            {
                warn!(error = %e, "transport stopped");
            }
        });

        if let Some(path) = cfg.location_feed.clone() {
            let feed = (*feed).clone();
            tokio::spawn(async move {
                if let Err(e) = location::run_feed(&path, feed).await {
                    warn!(path = %path.display(), error = %e, "location feed stopped");
                }
            });
        }

        shutdown_signal().await?;
        info!("shutting down");
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

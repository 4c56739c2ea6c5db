use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use radar_scand::api;
use radar_scand::config::Config;
use radar_scand::coordinator::ScanCoordinator;
use radar_scand::probe::{MdnsProbe, Probe, SsdpProbe};
use radar_scand::public_network::HttpPublicNetwork;

fn build_probes(config: &Config) -> Result<Vec<Arc<dyn Probe>>> {
    let mut probes: Vec<Arc<dyn Probe>> = Vec::new();

    if config.mdns.enabled {
        probes.push(Arc::new(MdnsProbe::new(config.mdns.clone())));
    }
    if config.upnp.enabled {
        let ssdp = SsdpProbe::new(config.upnp.clone()).context("Failed to set up SSDP probe")?;
        probes.push(Arc::new(ssdp));
    }

    if probes.is_empty() {
        tracing::warn!("All discovery protocols are disabled; every scan will fail");
    }
    Ok(probes)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("radar_scand=info"))
        )
        .init();

    tracing::info!("Starting radar-scand");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/radar/scand.toml".to_string());

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let probes = build_probes(&config)?;
    let coordinator = ScanCoordinator::new(config.scan.clone(), probes);
    tracing::info!(probes = ?coordinator.probe_names(), "Scan coordinator ready");

    let public_network = HttpPublicNetwork::new(&config.public_network)
        .context("Failed to create public network client")?;

    let app_state = api::routes::AppState {
        coordinator: coordinator.clone(),
        public_network: Arc::new(public_network),
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Stop the scan first so open SSE streams see its terminal event
    coordinator.shutdown().await;
    cancel.cancel();

    if let Err(e) = server_handle.await {
        tracing::error!("Server task failed: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

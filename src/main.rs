use oidc_gate::http::router;
use oidc_gate::prelude::*;
use std::error::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "oidc-gate.yaml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,oidc_gate=debug")),
        )
        .init();

    // --- Load Configuration from YAML ---
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("OIDC_GATE_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let file_config = FileConfig::from_path(&config_path)?;
    let config = file_config.to_config()?;
    info!(
        path = %config_path,
        issuer = %config.issuer,
        discovery_url = %config.key_source.discovery_url,
        "Configuration loaded"
    );

    // --- Configure the gate ---
    let gate = AuthGate::new(config)?;
    if let Err(e) = gate.warm_up().await {
        // Not fatal: keys are fetched again on the first request.
        warn!(error = %e, "Initial key fetch failed");
    }
    if gate.start_background_refresh() {
        info!("Background key refresh started");
    }

    let app = router(gate, &file_config.allowed_origins)?;
    let listener = TcpListener::bind(&file_config.listen_addr).await?;
    info!("oidc-gate listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("oidc-gate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

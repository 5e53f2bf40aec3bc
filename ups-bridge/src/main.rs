//! UPS Bridge - power cut notifier for a LAN UPS detector
//!
//! This bridge watches a network power detector and alerts people by SMS:
//! - Finds the detector with a UDP broadcast handshake
//! - Keeps a TCP session open to it, reconnecting with backoff
//! - Acknowledges every status report and tracks on/off transitions
//! - While power is off, sends the cloud's power-cut template to its
//!   recipients at the configured interval until power comes back

mod bridge;
mod cloud;
mod config;
mod discovery;
mod error;
mod health;
mod models;
mod notifier;
mod session;
mod status;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use bridge::Bridge;
use cloud::CloudAuthClient;
use config::BridgeConfig;
use health::HealthTracker;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ups_bridge=info")),
        )
        .init();

    info!("🔋 UPS Bridge v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::load()
        .await
        .context("Failed to load configuration")?;

    let client = CloudAuthClient::new(config.cloud.clone(), config.notify.default_alert_minutes)
        .context("Failed to create cloud client")?;

    // Credential is fetched again on first use if this fails
    if let Err(e) = client.ensure_credential().await {
        warn!("Initial cloud login failed: {}", e);
    }

    let health = HealthTracker::new();
    let cancel = CancellationToken::new();
    let reporter = health.spawn_reporter(
        Duration::from_secs(config.health.report_interval_secs),
        cancel.clone(),
    );

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    cancel.cancel();
                }
                Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
            }
        }
    });

    let bridge = Bridge::new(config, Arc::new(client), health, cancel.clone());
    let outcome = bridge.run().await;

    cancel.cancel();
    let _ = reporter.await;

    outcome.context("Bridge execution failed")?;
    Ok(())
}

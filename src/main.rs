//! pipeline-feed entry point.
//!
//! Headless dashboard: subscribes to every channel and logs each snapshot
//! until interrupted.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use pipeline_feed::domain::{MonitorEventsChannel, StatusChannel, WorkerStatusChannel};
use pipeline_feed::{Channel, ChannelRegistry, Credential, CredentialStore, FeedConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = FeedConfig::from_env()?;
    tracing::info!(base_url = %config.base_url, backoff = ?config.backoff, "starting pipeline-feed");

    // Credentials come from the environment here; a UI would call login()
    let credentials = CredentialStore::new();
    if let Ok(token) = std::env::var("FEED_ACCESS_TOKEN") {
        let token_type =
            std::env::var("FEED_TOKEN_TYPE").unwrap_or_else(|_| "Bearer".to_string());
        credentials.login(Credential::new(token, token_type));
    }
    if !credentials.is_authenticated() {
        tracing::warn!("FEED_ACCESS_TOKEN not set; channels will stay idle");
    }

    let registry = ChannelRegistry::http(&config, Arc::new(credentials.clone()))?;

    let _status = registry.subscribe_to::<StatusChannel, _>(|status| {
        tracing::info!(
            queue = status.queue,
            processing = status.processing.len(),
            done = status.done.len(),
            errors = status.errors.len(),
            "status"
        );
    });
    let _workers = registry.subscribe_to::<WorkerStatusChannel, _>(|workers| {
        tracing::info!(
            workers = workers.workers.len(),
            healthy = workers.healthy_count(),
            "worker status"
        );
        for (name, health) in &workers.workers {
            if let Some(metrics) = health.metrics {
                tracing::debug!(
                    worker = %name,
                    status = %health.status,
                    cpu = metrics.cpu,
                    mem = metrics.mem,
                    "worker metrics"
                );
            }
        }
    });
    let _events = registry.subscribe_to::<MonitorEventsChannel, _>(|history| {
        if let Some(latest) = history.events.last() {
            tracing::info!(
                events = history.events.len(),
                latest = %latest.kind,
                worker = latest.worker.as_deref().unwrap_or("-"),
                "monitor events"
            );
        }
    });

    tokio::signal::ctrl_c().await?;

    for channel in Channel::ALL {
        if let Some(status) = registry.connection_status(channel) {
            tracing::info!(
                channel = %channel,
                state = %status.state,
                attempts = status.attempts,
                frames = status.frames,
                malformed = status.malformed_frames,
                last_error = status.last_error.as_deref().unwrap_or("-"),
                last_error_code = status.last_error_code.unwrap_or_default(),
                "connection summary"
            );
        }
    }
    tracing::info!("shutting down");

    Ok(())
}

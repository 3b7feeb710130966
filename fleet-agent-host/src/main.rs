//! Fleet agent host entry point
//!
//! Starts `instances` simulated agents named `<prefix>-<index>`, each with its
//! own MQTT connection, until ctrl-c.

use anyhow::{Context, Result};
use fleet_agent::agent::{spawn_instance, SharedStatus};
use fleet_agent::config::AgentConfig;
use fleet_agent::{metrics, persist};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Refreshes the shared host status until shutdown.
fn spawn_status_refresher(status: SharedStatus, period: Duration, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let fresh = metrics::collect_status().await;
                    *status.write() = fresh;
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🤖 Fleet agent host v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load agent config")?;
    let prefix = config.name_prefix();
    let settings = config.agent.clone();
    info!(
        "simulating {} agent(s) as {}-*, broker {}:{}",
        settings.instances, prefix, config.mqtt.broker_host, config.mqtt.broker_port
    );

    let status: SharedStatus = Arc::new(RwLock::new(metrics::collect_status().await));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, stopping agents"),
            Err(e) => error!("cannot listen for ctrl-c: {}", e),
        }
        shutdown_tx.send(true).ok();
    });

    let refresher = spawn_status_refresher(status.clone(), settings.heartbeat_interval(), shutdown_rx.clone());

    let mut handles = Vec::with_capacity(settings.instances);
    for index in 0..settings.instances {
        if *shutdown_rx.borrow() {
            break;
        }
        let name = format!("{}-{}", prefix, index);
        let state = persist::load_and_bump(&settings.persistent_dir, &name)
            .await
            .with_context(|| format!("Failed to load persistent state of {}", name))?;

        handles.push(spawn_instance(
            name,
            state.sequence_number,
            &config.mqtt,
            settings.clone(),
            status.clone(),
            shutdown_rx.clone(),
        ));
        tokio::time::sleep(settings.spawn_interval()).await;
    }

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!("agent task ended abnormally: {}", e);
        }
    }
    refresher.await.ok();
    info!("fleet agent host stopped");
    Ok(())
}

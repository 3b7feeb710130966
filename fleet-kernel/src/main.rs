/**
 * FLEET KERNEL - Point d'entrée du contrôleur de flotte
 *
 * RÔLE : Orchestration de tous les modules : config, restore, MQTT,
 * dispatcher, boucle de snapshot, HTTP.
 *
 * DÉMARRAGE :
 * 1. config + logs
 * 2. restore depuis le chunk store (store injoignable = arrêt)
 * 3. connexion MQTT (échec = arrêt), dispatcher, listener
 * 4. boucle de snapshot, serveur HTTP
 * ctrl-c : signal watch, fin du cycle en cours, arrêt gracieux du HTTP.
 */

use anyhow::{Context, Result};
use fleet_kernel::config::load_config;
use fleet_kernel::dispatch::Dispatcher;
use fleet_kernel::health::HealthTracker;
use fleet_kernel::http::{build_router, AppState};
use fleet_kernel::mqtt;
use fleet_kernel::reconciler::Reconciler;
use fleet_kernel::snapshot::{self, SnapshotEngine, SnapshotSettings};
use fleet_kernel::state::FleetState;
use fleet_kernel::store::{ChunkStore, FileChunkStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await.context("loading kernel config")?;
    let settings = SnapshotSettings::from_config(&cfg);

    // état persistant
    let store: Arc<dyn ChunkStore> = Arc::new(
        FileChunkStore::open(&cfg.snapshot.store_dir)
            .await
            .with_context(|| format!("opening chunk store {}", cfg.snapshot.store_dir.display()))?,
    );
    let restored = snapshot::restore(store.as_ref(), &settings.namespace, settings.codec)
        .await
        .context("chunk store unreachable at startup")?;
    let reconciler = Reconciler::with_definitions(cfg.workloads.clone()).context("hashing workload definitions")?;
    let state = Arc::new(FleetState::restore(restored.agents.clone(), reconciler));
    let engine = SnapshotEngine::new(store, settings).resume_from(&restored);

    // transport
    let (client, eventloop) = mqtt::connect(&cfg.mqtt).await.context("MQTT setup")?;
    let (dispatcher, _workers) =
        Dispatcher::spawn(Arc::new(client.clone()), cfg.publish.workers, cfg.publish.queue_capacity);
    let health = HealthTracker::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = mqtt::spawn_listener(
        client,
        eventloop,
        state.clone(),
        dispatcher.clone(),
        health.clone(),
        shutdown_rx.clone(),
    );
    let snapshots = tokio::spawn(snapshot::run_loop(
        engine,
        state.clone(),
        dispatcher.clone(),
        health.clone(),
        cfg.snapshot_interval(),
        shutdown_rx.clone(),
    ));

    // HTTP
    let app = build_router(AppState { state, dispatcher, health });
    let http = TcpListener::bind(&cfg.http.listen)
        .await
        .with_context(|| format!("binding {}", cfg.http.listen))?;
    info!("fleet kernel listening on http://{}", cfg.http.listen);

    let mut http_shutdown = shutdown_rx;
    let server = tokio::spawn(async move {
        axum::serve(http, app)
            .with_graceful_shutdown(async move {
                http_shutdown.changed().await.ok();
            })
            .await
    });

    tokio::signal::ctrl_c().await.context("installing ctrl-c handler")?;
    info!("shutdown requested");
    shutdown_tx.send(true).ok();

    if let Err(e) = snapshots.await {
        error!("snapshot loop panicked: {}", e);
    }
    listener.await.ok();
    match server.await {
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    info!("fleet kernel stopped");
    Ok(())
}

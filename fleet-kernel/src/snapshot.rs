/**
 * SNAPSHOT ENGINE - Sweep périodique, persistance en chunks et restauration
 *
 * RÔLE :
 * Un cycle par intervalle : sweep de la machine d'état (Offline / promotion +
 * acks), reconstruction de la projection /nodes, sérialisation de la map
 * d'agents, compression, découpage, remplacement des chunks de la génération
 * précédente, puis publication des acks et du désiré des agents promus.
 *
 * FONCTIONNEMENT :
 * - Store : delete de l'ancienne génération puis create de la nouvelle, sans
 *   transaction. Un crash entre les deux laisse zéro chunk ou une génération
 *   partielle, relue au démarrage comme "pas de snapshot" (cold start).
 * - Chaque opération store est réessayée (retries fixes, délai fixe) puis
 *   abandonnée et loguée ; le cycle n'échoue jamais pour un chunk.
 * - Restore : liste du namespace, génération complète la plus récente,
 *   tri par index, concaténation, décompression, désérialisation.
 *
 * Seule une erreur de list au démarrage est fatale.
 */

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::agents::{AgentsMap, SweepStats};
use crate::codec::{Codec, CodecError};
use crate::config::KernelConfig;
use crate::dispatch::Dispatcher;
use crate::health::HealthTracker;
use crate::state::FleetState;
use crate::store::{ChunkStore, SnapshotChunk, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("cannot serialize fleet state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("chunk store error: {0}")]
    Store(#[from] StoreError),
    #[error("compression task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub namespace: String,
    pub codec: Codec,
    pub max_chunk_bytes: usize,
    pub store_concurrency: usize,
    pub store_retries: u32,
    pub store_retry_delay: Duration,
    pub heartbeat_timeout: Duration,
}

impl SnapshotSettings {
    pub fn from_config(cfg: &KernelConfig) -> Self {
        Self {
            namespace: cfg.snapshot.namespace.clone(),
            codec: cfg.snapshot.codec,
            max_chunk_bytes: cfg.snapshot.max_chunk_bytes,
            store_concurrency: cfg.snapshot.store_concurrency,
            store_retries: cfg.snapshot.store_retries,
            store_retry_delay: Duration::from_millis(cfg.snapshot.store_retry_delay_ms),
            heartbeat_timeout: cfg.heartbeat_timeout(),
        }
    }
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self::from_config(&KernelConfig::default())
    }
}

/// Résultat d'un cycle, pour les logs et /health
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CycleReport {
    pub generation: u64,
    pub stats: SweepStats,
    pub payload_bytes: usize,
    pub stored_bytes: usize,
    pub chunks_written: usize,
    pub chunks_failed: usize,
    pub deletes_failed: usize,
    pub acks_dispatched: usize,
    pub commands_dispatched: usize,
    pub elapsed_ms: u128,
}

/// État relu au démarrage
#[derive(Debug, Default)]
pub struct Restored {
    pub agents: AgentsMap,
    /// génération relue, None = cold start
    pub generation: Option<u64>,
    /// tous les noms présents dans le namespace, à supprimer au premier cycle
    pub existing_names: Vec<String>,
    pub next_generation: u64,
}

/// Découpe en morceaux de `max` octets au plus ; ceil(len / max) morceaux.
pub fn split_chunks(data: &[u8], max: usize) -> Vec<&[u8]> {
    data.chunks(max.max(1)).collect()
}

pub struct SnapshotEngine {
    store: Arc<dyn ChunkStore>,
    settings: SnapshotSettings,
    generation: u64,
    previous_names: Vec<String>,
    first_cycle: Option<Instant>,
    last_cycle: Option<Instant>,
}

impl SnapshotEngine {
    pub fn new(store: Arc<dyn ChunkStore>, settings: SnapshotSettings) -> Self {
        Self {
            store,
            settings,
            generation: 0,
            previous_names: Vec::new(),
            first_cycle: None,
            last_cycle: None,
        }
    }

    /// Reprend la numérotation après un restore et programme la suppression
    /// de tout ce qui existait déjà dans le namespace.
    pub fn resume_from(mut self, restored: &Restored) -> Self {
        self.generation = restored.next_generation;
        self.previous_names = restored.existing_names.clone();
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn settings(&self) -> &SnapshotSettings {
        &self.settings
    }

    pub async fn run_cycle(&mut self, state: &FleetState, dispatcher: &Dispatcher) -> Result<CycleReport, SnapshotError> {
        self.run_cycle_at(state, dispatcher, OffsetDateTime::now_utc()).await
    }

    pub async fn run_cycle_at(
        &mut self,
        state: &FleetState,
        dispatcher: &Dispatcher,
        now: OffsetDateTime,
    ) -> Result<CycleReport, SnapshotError> {
        let started = Instant::now();
        let first = *self.first_cycle.get_or_insert(started);
        let generation = self.generation;
        info!("snapshot cycle {} start", generation);

        // 1-3 : sweep + projection + sérialisation, sous verrou exclusif
        let outcome = state.agents.sweep(now, self.settings.heartbeat_timeout)?;
        state.query.reset(outcome.statuses);

        let mut report = CycleReport {
            generation,
            stats: outcome.stats,
            payload_bytes: outcome.payload.len(),
            ..Default::default()
        };

        // 4-6 : hors verrou
        match self.compress(outcome.payload).await {
            Ok(stored) => {
                report.stored_bytes = stored.len();
                self.replace_chunks(generation, &stored, &mut report).await;
            }
            Err(e) => error!("snapshot {} not stored: {}", generation, e),
        }

        // 7 : acks + désiré des agents promus, jamais attendus
        for ack in &outcome.acks {
            if dispatcher.dispatch_ack(ack) {
                report.acks_dispatched += 1;
            }
            let cmds = state.reconciler.desired_commands(&ack.agent_name);
            report.commands_dispatched += dispatcher.dispatch_commands(&ack.agent_name, &cmds);
        }
        if !outcome.went_offline.is_empty() {
            debug!("went offline: {:?}", outcome.went_offline);
        }

        report.elapsed_ms = started.elapsed().as_millis();
        let since_last = self.last_cycle.map(|t| started.duration_since(t).as_secs()).unwrap_or(0);
        info!(
            "snapshot {}: registering {} registered {} offline {} total {} payload {}B stored {}B in {} chunks",
            generation,
            report.stats.registering,
            report.stats.registered,
            report.stats.offline,
            report.stats.total(),
            report.payload_bytes,
            report.stored_bytes,
            report.chunks_written,
        );
        info!(
            "snapshot {} took {} ms, {} s since previous, {} s since first",
            generation,
            report.elapsed_ms,
            since_last,
            started.duration_since(first).as_secs()
        );
        for (minutes, count) in &report.stats.silence_minutes {
            info!("silent for {} min: {} agents", minutes, count);
        }

        self.last_cycle = Some(started);
        self.generation += 1;
        Ok(report)
    }

    async fn compress(&self, payload: Vec<u8>) -> Result<Vec<u8>, SnapshotError> {
        let codec = self.settings.codec;
        if codec == Codec::None {
            return Ok(payload);
        }
        let packed = tokio::task::spawn_blocking(move || codec.compress(&payload)).await??;
        Ok(packed)
    }

    async fn replace_chunks(&mut self, generation: u64, data: &[u8], report: &mut CycleReport) {
        let namespace = self.settings.namespace.clone();
        let retries = self.settings.store_retries;
        let delay = self.settings.store_retry_delay;
        let concurrency = self.settings.store_concurrency.max(1);

        let old = std::mem::take(&mut self.previous_names);
        let deletes = stream::iter(old.into_iter().map(|name| {
            let store = self.store.clone();
            let namespace = namespace.clone();
            async move {
                let res = with_retries(retries, delay, || async {
                    match store.delete(&namespace, &name).await {
                        Err(StoreError::NotFound(_)) => Ok(()),
                        other => other,
                    }
                })
                .await;
                (name, res)
            }
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;

        let mut keep = Vec::new();
        for (name, res) in deletes {
            if let Err(e) = res {
                warn!("abandon delete of chunk {}: {}", name, e);
                report.deletes_failed += 1;
                keep.push(name);
            }
        }

        let pieces = split_chunks(data, self.settings.max_chunk_bytes);
        let total = pieces.len();
        let creates = stream::iter(pieces.into_iter().enumerate().map(|(index, piece)| {
            let store = self.store.clone();
            let chunk = SnapshotChunk::new(&namespace, generation, index, total, piece.to_vec());
            async move {
                let res = with_retries(retries, delay, || store.create(&chunk)).await;
                (chunk.name, res)
            }
        }).collect::<Vec<_>>())
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;

        for (name, res) in creates {
            match res {
                Ok(()) => {
                    report.chunks_written += 1;
                    keep.push(name);
                }
                Err(e) => {
                    error!("abandon chunk {}: {}", name, e);
                    report.chunks_failed += 1;
                }
            }
        }
        // ce qui reste en store sera supprimé au cycle suivant
        self.previous_names = keep;
    }
}

async fn with_retries<F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let attempts = attempts.max(1);
    let mut tried = 0;
    loop {
        tried += 1;
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if tried >= attempts => return Err(e),
            Err(e) => {
                debug!("store attempt {}/{} failed: {}", tried, attempts, e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Relit le dernier snapshot complet du namespace. Erreur = store injoignable.
pub async fn restore(store: &dyn ChunkStore, namespace: &str, codec: Codec) -> Result<Restored, SnapshotError> {
    let chunks = store.list(namespace).await?;
    let existing_names: Vec<String> = chunks.iter().map(|c| c.name.clone()).collect();

    let mut by_generation: BTreeMap<u64, Vec<SnapshotChunk>> = BTreeMap::new();
    for chunk in chunks.into_iter().filter(SnapshotChunk::is_summary) {
        match chunk.generation() {
            Some(g) => by_generation.entry(g).or_default().push(chunk),
            None => warn!("chunk {} has no generation label, ignored", chunk.name),
        }
    }
    let next_generation = by_generation.keys().next_back().map(|g| g + 1).unwrap_or(0);

    let mut restored = Restored {
        existing_names,
        next_generation,
        ..Default::default()
    };

    for (generation, mut chunks) in by_generation.into_iter().rev() {
        chunks.sort_by_key(|c| c.index);
        if !is_complete(&chunks) {
            warn!("snapshot generation {} incomplete ({} chunks), skipped", generation, chunks.len());
            continue;
        }

        let packed: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        let decoded = codec
            .decompress(&packed)
            .map_err(SnapshotError::from)
            .and_then(|raw| serde_json::from_slice::<AgentsMap>(&raw).map_err(SnapshotError::from));

        match decoded {
            Ok(agents) => {
                info!("restored {} agents from snapshot generation {}", agents.len(), generation);
                restored.agents = agents;
                restored.generation = Some(generation);
                return Ok(restored);
            }
            Err(e) => {
                warn!("snapshot generation {} unreadable: {}", generation, e);
            }
        }
    }

    info!("no usable snapshot in {}, cold start", namespace);
    Ok(restored)
}

fn is_complete(sorted: &[SnapshotChunk]) -> bool {
    let Some(total) = sorted.first().and_then(SnapshotChunk::total) else {
        return false;
    };
    sorted.len() == total
        && sorted.iter().enumerate().all(|(i, c)| c.index == i && c.total() == Some(total))
}

/// Boucle périodique du contrôleur. Le cycle en cours se termine avant l'arrêt.
pub async fn run_loop(
    mut engine: SnapshotEngine,
    state: Arc<FleetState>,
    dispatcher: Dispatcher,
    health: HealthTracker,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("snapshot loop every {:?} into namespace {}", period, engine.settings().namespace);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match engine.run_cycle(&state, &dispatcher).await {
                    Ok(report) => health.record_snapshot(report),
                    Err(e) => error!("snapshot cycle failed: {}", e),
                }
            }
        }
    }
    info!("snapshot loop stopped at generation {}", engine.generation());
}

/**
 * FLEET STATE - État partagé du contrôleur
 *
 * RÔLE : regroupe registre d'agents, filtre d'ordre, cache observé,
 * reconciler et projection de requête derrière un seul `Arc`.
 *
 * FONCTIONNEMENT (consume_heartbeat) :
 * filtre -> cache observé -> diff désiré/observé -> machine d'état -> amorçage
 * d'un nouvel agent. Les commandes produites sont renvoyées à l'appelant,
 * qui les confie au dispatcher.
 */

use fleet_proto::{HeartbeatRecord, WorkloadCommand};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::agents::{AgentRegistry, AgentsMap, Arrival};
use crate::filter::{FilterDecision, HeartbeatFilter};
use crate::models::{NodeQueryStatus, WorkloadRollup, WorkloadView};
use crate::observed::ObservedCache;
use crate::query::QueryStatusCache;
use crate::reconciler::Reconciler;

pub type SharedState = Arc<FleetState>;

#[derive(Debug, Default)]
pub struct IngestCounters {
    pub received: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub malformed: u64,
}

/// Issue du traitement d'un heartbeat
#[derive(Debug)]
pub enum Ingest {
    Rejected(FilterDecision),
    Accepted {
        arrival: Arrival,
        commands: Vec<WorkloadCommand>,
    },
}

#[derive(Debug, Default)]
pub struct FleetState {
    pub agents: AgentRegistry,
    pub filter: HeartbeatFilter,
    pub observed: ObservedCache,
    pub reconciler: Reconciler,
    pub query: QueryStatusCache,
    counters: IngestCounters,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reconciler(reconciler: Reconciler) -> Self {
        Self { reconciler, ..Default::default() }
    }

    /// Reconstruit l'état dérivé depuis un snapshot : filtre, cache observé,
    /// désiré de chaque agent et projection `/nodes` (datée du last_seen
    /// restauré, le premier sweep la remplace). Rien n'est publié ; le
    /// prochain heartbeat de chaque agent fera le diff.
    pub fn restore(agents: AgentsMap, reconciler: Reconciler) -> Self {
        let filter = HeartbeatFilter::new();
        let observed = ObservedCache::new();
        observed.rebuild(&agents);
        let query = QueryStatusCache::new();
        query.reset(
            agents
                .iter()
                .map(|(name, entry)| (name.clone(), NodeQueryStatus::observed(entry, entry.last_seen)))
                .collect(),
        );

        for (name, entry) in &agents {
            filter.seed(name, entry.record.seqnum, entry.record.timestamp);
            let seeded = reconciler.add_host(name, &entry.record.labels);
            debug!("restored {} with {} desired workloads", name, seeded.len());
        }
        info!("fleet state restored with {} agents", agents.len());

        Self {
            agents: AgentRegistry::from_entries(agents),
            filter,
            observed,
            reconciler,
            query,
            counters: IngestCounters::default(),
        }
    }

    /// Ingestion d'un payload brut reçu sur `heartbeat`.
    pub fn ingest_payload(&self, payload: &[u8], now: OffsetDateTime) -> Option<(String, Ingest)> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match HeartbeatRecord::from_slice(payload) {
            Ok(record) => {
                let name = record.name.clone();
                Some((name, self.consume_heartbeat_counted(record, now)))
            }
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("malformed heartbeat dropped: {}", e);
                None
            }
        }
    }

    pub fn consume_heartbeat(&self, record: HeartbeatRecord, now: OffsetDateTime) -> Ingest {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.consume_heartbeat_counted(record, now)
    }

    fn consume_heartbeat_counted(&self, record: HeartbeatRecord, now: OffsetDateTime) -> Ingest {
        let decision = self.filter.decide(&record.name, record.seqnum, record.timestamp);
        if !decision.is_accepted() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Ingest::Rejected(decision);
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        self.observed.record(&record.name, &record.pods);
        // agent inconnu du reconciler : rien ici, add_host amorce plus bas
        let mut commands = self.reconciler.reconcile_at(&record, now);

        let name = record.name.clone();
        let labels = record.labels.clone();
        let arrival = self.agents.receive_heartbeat(record, now);
        commands.extend(self.reconciler.add_host(&name, &labels));

        if arrival != Arrival::Known {
            info!("agent {} {:?}, registering", name, arrival);
        }
        Ingest::Accepted { arrival, commands }
    }

    /// Définitions avec le décompte désiré / observé / prêt
    pub fn workload_rollup(&self) -> Vec<WorkloadView> {
        self.reconciler
            .targets()
            .into_iter()
            .map(|t| WorkloadView {
                status: WorkloadRollup {
                    desired: t.desired,
                    scheduled: self.observed.agents_running(&t.key).len(),
                    ready: self.observed.ready_count(&t.key, &t.hash),
                },
                definition: t.definition,
                hash: t.hash,
            })
            .collect()
    }

    pub fn ingest_stats(&self) -> IngestStats {
        IngestStats {
            received: self.counters.received.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }
}

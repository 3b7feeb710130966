use fleet_proto::{HeartbeatRecord, NodeState, WorkloadSpec};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Préfixe des workloads dérivés d'une définition fleet-wide
pub const WORKLOAD_PREFIX: &str = "fleetset-";

/// Définition fleet-wide d'un workload (une copie par agent sélectionné).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDefinition {
    pub name: String,
    pub namespace: String,
    pub spec: WorkloadSpec,
}

impl WorkloadDefinition {
    /// Nom du workload tel qu'il tourne sur l'agent
    pub fn workload_name(&self) -> String {
        format!("{}{}", WORKLOAD_PREFIX, self.name)
    }

    pub fn key(&self) -> String {
        fleet_proto::workload_key(&self.namespace, &self.workload_name())
    }
}

/// Décompte d'un workload sur la flotte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRollup {
    /// agents dont le désiré contient le workload
    pub desired: usize,
    /// agents qui le rapportent, quel que soit le hash
    pub scheduled: usize,
    /// agents qui le font tourner au hash courant
    pub ready: usize,
}

/// Ligne de `GET /workloads`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadView {
    #[serde(flatten)]
    pub definition: WorkloadDefinition,
    pub hash: String,
    pub status: WorkloadRollup,
}

/// Miroir côté kernel d'un agent : dernier heartbeat accepté + last_seen (jamais sur le fil).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    #[serde(flatten)]
    pub record: HeartbeatRecord,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Projection lecture seule exposée sur `/nodes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeQueryStatus {
    pub name: String,
    pub state: NodeState,
    /// Instant du sweep (ou de la restauration) qui a produit cette ligne
    #[serde(rename = "lastObserved", with = "time::serde::rfc3339")]
    pub last_observed: OffsetDateTime,
}

impl NodeQueryStatus {
    pub fn observed(entry: &AgentEntry, at: OffsetDateTime) -> Self {
        Self { name: entry.record.name.clone(), state: entry.record.state, last_observed: at }
    }
}

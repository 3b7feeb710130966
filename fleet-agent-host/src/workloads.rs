//! Local workload store of one agent instance.
//!
//! Sync commands upsert, delete commands remove. Applying the same command
//! twice leaves the store as applying it once.

use fleet_proto::{WorkloadCommand, WorkloadPhase, WorkloadSpec, WorkloadStatus, WorkloadSummary};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalWorkload {
    pub hash: String,
    pub name: String,
    pub namespace: String,
    pub spec: Option<WorkloadSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
    Removed,
    /// delete for a workload that is not here
    Absent,
}

#[derive(Debug, Default)]
pub struct LocalWorkloads {
    by_key: RwLock<BTreeMap<String, LocalWorkload>>,
}

impl LocalWorkloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, cmd: &WorkloadCommand) -> Applied {
        let key = cmd.key();
        let mut by_key = self.by_key.write();

        if cmd.is_delete() {
            return match by_key.remove(&key) {
                Some(_) => {
                    info!("workload {} removed", key);
                    Applied::Removed
                }
                None => Applied::Absent,
            };
        }

        let incoming = LocalWorkload {
            hash: cmd.hash.clone(),
            name: cmd.name.clone(),
            namespace: cmd.namespace.clone(),
            spec: cmd.spec.clone(),
        };
        match by_key.insert(key.clone(), incoming) {
            None => {
                info!("workload {} created ({})", key, cmd.hash);
                Applied::Created
            }
            Some(prev) if prev.hash == cmd.hash => {
                debug!("workload {} already at {}", key, cmd.hash);
                Applied::Unchanged
            }
            Some(_) => {
                info!("workload {} updated to {}", key, cmd.hash);
                Applied::Updated
            }
        }
    }

    /// Heartbeat view: every local workload reported Running.
    pub fn summaries(&self) -> Vec<WorkloadSummary> {
        self.by_key
            .read()
            .values()
            .map(|w| WorkloadSummary {
                hash: w.hash.clone(),
                name: w.name.clone(),
                namespace: w.namespace.clone(),
                status: Some(WorkloadStatus { phase: WorkloadPhase::Running }),
            })
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<LocalWorkload> {
        self.by_key.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_key.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

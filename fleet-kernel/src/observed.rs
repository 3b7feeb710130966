//! Observed workloads: what each agent's last accepted heartbeat says it runs.

use fleet_proto::{WorkloadPhase, WorkloadSummary};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::agents::AgentsMap;

#[derive(Debug, Default)]
pub struct ObservedCache {
    by_agent: RwLock<HashMap<String, HashMap<String, WorkloadSummary>>>,
}

impl ObservedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the agent's observed set wholesale.
    pub fn record(&self, agent: &str, pods: &[WorkloadSummary]) {
        let set = pods.iter().map(|p| (p.key(), p.clone())).collect();
        self.by_agent.write().insert(agent.to_string(), set);
    }

    pub fn get(&self, agent: &str) -> Option<HashMap<String, WorkloadSummary>> {
        self.by_agent.read().get(agent).cloned()
    }

    /// Agents currently reporting the given workload key
    pub fn agents_running(&self, key: &str) -> Vec<String> {
        self.by_agent
            .read()
            .iter()
            .filter(|(_, set)| set.contains_key(key))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Agents qui font tourner `key` au bon hash, en phase Running
    pub fn ready_count(&self, key: &str, hash: &str) -> usize {
        self.by_agent
            .read()
            .values()
            .filter_map(|set| set.get(key))
            .filter(|w| w.hash == hash && w.status.as_ref().is_some_and(|s| s.phase == WorkloadPhase::Running))
            .count()
    }

    pub fn rebuild(&self, agents: &AgentsMap) {
        let mut by_agent = self.by_agent.write();
        by_agent.clear();
        for (name, entry) in agents {
            let set = entry.record.pods.iter().map(|p| (p.key(), p.clone())).collect();
            by_agent.insert(name.clone(), set);
        }
    }

    pub fn len(&self) -> usize {
        self.by_agent.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

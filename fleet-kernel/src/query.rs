//! Read-only node status projection, rebuilt wholesale on every sweep.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::models::NodeQueryStatus;

#[derive(Debug, Default)]
pub struct QueryStatusCache {
    statuses: RwLock<HashMap<String, NodeQueryStatus>>,
}

impl QueryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, statuses: HashMap<String, NodeQueryStatus>) {
        *self.statuses.write() = statuses;
    }

    pub fn get(&self, name: &str) -> Option<NodeQueryStatus> {
        self.statuses.read().get(name).cloned()
    }

    /// Sorted by name
    pub fn list(&self) -> Vec<NodeQueryStatus> {
        let mut all: Vec<_> = self.statuses.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.statuses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

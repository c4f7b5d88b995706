use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::traffic::NodeHealth;
use crate::domain::{ProcessKey, RuleId};

/// Last-write-wins reachability per (rule, node).
#[derive(Default)]
pub struct HealthCache {
    entries: Mutex<HashMap<ProcessKey, NodeHealth>>,
}

impl HealthCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: ProcessKey, health: NodeHealth) {
        self.entries().insert(key, health);
    }

    pub fn get(&self, key: ProcessKey) -> Option<NodeHealth> {
        self.entries().get(&key).copied()
    }

    /// Nodes without a record count as unhealthy.
    pub fn is_healthy(&self, key: ProcessKey) -> bool {
        self.get(key).is_some_and(|health| health.healthy)
    }

    pub fn forget_rule(&self, rule_id: RuleId) {
        self.entries().retain(|key, _| key.rule_id != rule_id);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ProcessKey, NodeHealth>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

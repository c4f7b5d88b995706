use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::alert::{AlertCandidate, AlertConfig, AlertType, ForwardAlertHistory};
use crate::domain::rule::{ForwardRule, RuleError};
use crate::domain::traffic::ForwardTrafficHistory;
use crate::domain::{NodeId, RuleId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rule {0} not found")]
    RuleNotFound(RuleId),
    #[error("alert {0} not found")]
    AlertNotFound(u64),
    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// Persistence consumed by the control plane.
pub trait ControlStore: Send + Sync {
    fn get_forward_rule(&self, rule_id: RuleId) -> Result<ForwardRule, StoreError>;
    /// Rejects nodes that are not relays of the rule.
    fn update_active_relay(&self, rule_id: RuleId, node_id: NodeId) -> Result<(), StoreError>;
    fn get_alert_config(&self, rule_id: RuleId) -> Result<AlertConfig, StoreError>;
    fn create_alert_history(
        &self,
        rule_id: RuleId,
        node_id: NodeId,
        candidate: &AlertCandidate,
        created_at: OffsetDateTime,
    ) -> Result<ForwardAlertHistory, StoreError>;
    fn latest_alert_by_type(
        &self,
        rule_id: RuleId,
        alert_type: AlertType,
    ) -> Result<Option<ForwardAlertHistory>, StoreError>;
    fn acknowledge_alert(
        &self,
        alert_id: u64,
        by: &str,
        at: OffsetDateTime,
    ) -> Result<ForwardAlertHistory, StoreError>;
    /// Newest bucket first.
    fn list_traffic_history(
        &self,
        rule_id: RuleId,
        node_id: NodeId,
        limit: usize,
    ) -> Result<Vec<ForwardTrafficHistory>, StoreError>;
    /// Adds `bucket` into the stored bucket with the same start, creating it
    /// when absent, and returns the merged row.
    fn upsert_traffic_history(
        &self,
        bucket: &ForwardTrafficHistory,
    ) -> Result<ForwardTrafficHistory, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    rules: HashMap<RuleId, ForwardRule>,
    alert_configs: HashMap<RuleId, AlertConfig>,
    alerts: Vec<ForwardAlertHistory>,
    traffic: Vec<ForwardTrafficHistory>,
}

/// Process-local store for single-binary deployments and tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rule(&self, rule: ForwardRule) {
        self.state().rules.insert(rule.id, rule);
    }

    pub fn set_alert_config(&self, rule_id: RuleId, config: AlertConfig) {
        self.state().alert_configs.insert(rule_id, config);
    }

    pub fn alerts(&self) -> Vec<ForwardAlertHistory> {
        self.state().alerts.clone()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ControlStore for MemoryStore {
    fn get_forward_rule(&self, rule_id: RuleId) -> Result<ForwardRule, StoreError> {
        self.state()
            .rules
            .get(&rule_id)
            .cloned()
            .ok_or(StoreError::RuleNotFound(rule_id))
    }

    fn update_active_relay(&self, rule_id: RuleId, node_id: NodeId) -> Result<(), StoreError> {
        let mut state = self.state();
        let rule = state
            .rules
            .get_mut(&rule_id)
            .ok_or(StoreError::RuleNotFound(rule_id))?;
        rule.set_active_relay(node_id)?;
        Ok(())
    }

    fn get_alert_config(&self, rule_id: RuleId) -> Result<AlertConfig, StoreError> {
        Ok(self
            .state()
            .alert_configs
            .get(&rule_id)
            .cloned()
            .unwrap_or_default())
    }

    fn create_alert_history(
        &self,
        rule_id: RuleId,
        node_id: NodeId,
        candidate: &AlertCandidate,
        created_at: OffsetDateTime,
    ) -> Result<ForwardAlertHistory, StoreError> {
        let mut state = self.state();
        let alert = ForwardAlertHistory {
            id: state.alerts.len() as u64 + 1,
            rule_id,
            node_id,
            alert_type: candidate.alert_type,
            severity: candidate.severity,
            message: candidate.message.clone(),
            details: candidate.details.clone(),
            created_at,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
        };
        state.alerts.push(alert.clone());
        Ok(alert)
    }

    fn latest_alert_by_type(
        &self,
        rule_id: RuleId,
        alert_type: AlertType,
    ) -> Result<Option<ForwardAlertHistory>, StoreError> {
        Ok(self
            .state()
            .alerts
            .iter()
            .filter(|alert| alert.rule_id == rule_id && alert.alert_type == alert_type)
            .max_by_key(|alert| (alert.created_at, alert.id))
            .cloned())
    }

    fn acknowledge_alert(
        &self,
        alert_id: u64,
        by: &str,
        at: OffsetDateTime,
    ) -> Result<ForwardAlertHistory, StoreError> {
        let mut state = self.state();
        let alert = state
            .alerts
            .iter_mut()
            .find(|alert| alert.id == alert_id)
            .ok_or(StoreError::AlertNotFound(alert_id))?;
        alert.acknowledged = true;
        alert.acknowledged_at = Some(at);
        alert.acknowledged_by = Some(by.to_string());
        Ok(alert.clone())
    }

    fn list_traffic_history(
        &self,
        rule_id: RuleId,
        node_id: NodeId,
        limit: usize,
    ) -> Result<Vec<ForwardTrafficHistory>, StoreError> {
        let mut rows: Vec<ForwardTrafficHistory> = self
            .state()
            .traffic
            .iter()
            .filter(|row| row.rule_id == rule_id && row.node_id == node_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.bucket_start.cmp(&a.bucket_start));
        rows.truncate(limit);
        Ok(rows)
    }

    fn upsert_traffic_history(
        &self,
        bucket: &ForwardTrafficHistory,
    ) -> Result<ForwardTrafficHistory, StoreError> {
        let mut state = self.state();
        if let Some(row) = state.traffic.iter_mut().find(|row| {
            row.rule_id == bucket.rule_id
                && row.node_id == bucket.node_id
                && row.bucket_start == bucket.bucket_start
        }) {
            row.traffic_in = row.traffic_in.saturating_add(bucket.traffic_in);
            row.traffic_out = row.traffic_out.saturating_add(bucket.traffic_out);
            row.samples = row.samples.saturating_add(bucket.samples);
            return Ok(row.clone());
        }
        state.traffic.push(bucket.clone());
        Ok(bucket.clone())
    }
}

use std::sync::Arc;

use serde_json::json;
use time::{Duration, OffsetDateTime};

use crate::control::events::{ControlEvent, EventHub};
use crate::control::store::{ControlStore, StoreError};
use crate::domain::alert::{AlertCandidate, AlertConfig, AlertType, ForwardAlertHistory};
use crate::domain::traffic::ForwardStat;
use crate::domain::LinkStatus;
use crate::support::constants::SPIKE_HISTORY_POINTS;

/// Same-type alerts for a rule closer together than this are collapsed.
pub const DEDUP_WINDOW: Duration = Duration::minutes(5);
/// An acknowledged alert silences its type for this long.
pub const ACK_SILENCE: Duration = Duration::hours(24);

/// Alerts a single stat would raise, before deduplication.
pub fn alert_candidates(
    stat: &ForwardStat,
    is_entry: bool,
    config: &AlertConfig,
    current_delta: u64,
    history: &[u64],
) -> Vec<AlertCandidate> {
    let mut candidates = Vec::new();
    if !config.enabled {
        return candidates;
    }
    let status_alert = match (is_entry, stat.status) {
        (true, LinkStatus::Faulty) => Some(AlertType::LinkFaulty),
        (true, LinkStatus::Degraded) => Some(AlertType::LinkDegraded),
        (false, LinkStatus::Faulty) => Some(AlertType::NodeDown),
        _ => None,
    };
    if let Some(alert_type) = status_alert {
        let message = match alert_type {
            AlertType::NodeDown => format!(
                "rule {} relay on node {} is down",
                stat.rule_id, stat.node_id
            ),
            _ => format!(
                "rule {} link from entry node {} is {}",
                stat.rule_id,
                stat.node_id,
                stat.status.as_str()
            ),
        };
        candidates.push(candidate(
            alert_type,
            message,
            json!({ "node_id": stat.node_id, "port": stat.port, "status": stat.status.as_str() }),
        ));
    }
    if let Some(threshold) = config.latency_threshold_ms.filter(|ms| *ms > 0) {
        if stat.latency_ms >= threshold {
            candidates.push(candidate(
                AlertType::HighLatency,
                format!(
                    "rule {} latency {} ms on node {} exceeds {} ms",
                    stat.rule_id, stat.latency_ms, stat.node_id, threshold
                ),
                json!({ "node_id": stat.node_id, "latency_ms": stat.latency_ms, "threshold_ms": threshold }),
            ));
        }
    }
    if let Some(threshold) = config.traffic_spike_threshold {
        if let Some(average) = spike_average(current_delta, history, threshold) {
            candidates.push(candidate(
                AlertType::TrafficSpike,
                format!(
                    "rule {} traffic {} bytes on node {} is over {}x the recent average",
                    stat.rule_id, current_delta, stat.node_id, threshold
                ),
                json!({
                    "node_id": stat.node_id,
                    "delta": current_delta,
                    "average": average,
                    "threshold": threshold,
                }),
            ));
        }
    }
    candidates
}

/// Average of the recent deltas when `current` exceeds `threshold` times it.
///
/// Needs at least two history points and a non-zero average.
pub fn spike_average(current: u64, history: &[u64], threshold: f64) -> Option<f64> {
    let points = &history[..history.len().min(SPIKE_HISTORY_POINTS)];
    if points.len() < 2 {
        return None;
    }
    let average = points.iter().map(|value| *value as f64).sum::<f64>() / points.len() as f64;
    if average == 0.0 {
        return None;
    }
    (current as f64 > threshold * average).then_some(average)
}

/// True when `latest` still covers a new alert of the same type at `now`.
pub fn is_suppressed(latest: Option<&ForwardAlertHistory>, now: OffsetDateTime) -> bool {
    latest.is_some_and(|alert| {
        now - alert.created_at < DEDUP_WINDOW
            || (alert.acknowledged
                && alert
                    .acknowledged_at
                    .is_some_and(|at| now - at < ACK_SILENCE))
    })
}

fn candidate(alert_type: AlertType, message: String, details: serde_json::Value) -> AlertCandidate {
    AlertCandidate {
        alert_type,
        severity: alert_type.severity(),
        message,
        details,
    }
}

/// Raises deduplicated alerts from incoming stats.
pub struct AlertEvaluator {
    store: Arc<dyn ControlStore>,
    events: Arc<EventHub>,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn ControlStore>, events: Arc<EventHub>) -> Self {
        Self { store, events }
    }

    /// Returns the alerts that were recorded.
    pub fn evaluate(
        &self,
        stat: &ForwardStat,
        current_delta: u64,
        history: &[u64],
        now: OffsetDateTime,
    ) -> Result<Vec<ForwardAlertHistory>, StoreError> {
        let rule = self.store.get_forward_rule(stat.rule_id)?;
        let config = self.store.get_alert_config(stat.rule_id)?;
        let candidates = alert_candidates(
            stat,
            rule.is_entry(stat.node_id),
            &config,
            current_delta,
            history,
        );
        let mut raised = Vec::new();
        for candidate in candidates {
            let latest = self
                .store
                .latest_alert_by_type(stat.rule_id, candidate.alert_type)?;
            if is_suppressed(latest.as_ref(), now) {
                tracing::debug!(
                    rule_id = stat.rule_id,
                    alert = candidate.alert_type.as_str(),
                    "alert suppressed"
                );
                continue;
            }
            let alert =
                self.store
                    .create_alert_history(stat.rule_id, stat.node_id, &candidate, now)?;
            tracing::info!(
                rule_id = alert.rule_id,
                node_id = alert.node_id,
                alert = alert.alert_type.as_str(),
                message = %alert.message,
                "alert raised"
            );
            self.events.publish(ControlEvent::Alert(alert.clone()));
            raised.push(alert);
        }
        Ok(raised)
    }

    pub fn acknowledge_alert(
        &self,
        alert_id: u64,
        by: &str,
        at: OffsetDateTime,
    ) -> Result<ForwardAlertHistory, StoreError> {
        let alert = self.store.acknowledge_alert(alert_id, by, at)?;
        tracing::info!(alert_id, by, "alert acknowledged");
        Ok(alert)
    }
}

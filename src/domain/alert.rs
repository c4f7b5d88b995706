use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::{NodeId, RuleId};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LinkFaulty,
    LinkDegraded,
    NodeDown,
    HighLatency,
    TrafficSpike,
}

impl AlertType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LinkFaulty => "link_faulty",
            Self::LinkDegraded => "link_degraded",
            Self::NodeDown => "node_down",
            Self::HighLatency => "high_latency",
            Self::TrafficSpike => "traffic_spike",
        }
    }

    pub const fn severity(self) -> Severity {
        match self {
            Self::LinkFaulty | Self::NodeDown => Severity::Critical,
            Self::LinkDegraded | Self::HighLatency => Severity::Warning,
            Self::TrafficSpike => Severity::Info,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

/// Per-rule alert thresholds. A missing threshold disables that check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub latency_threshold_ms: Option<u64>,
    #[serde(default)]
    pub traffic_spike_threshold: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_threshold_ms: None,
            traffic_spike_threshold: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertCandidate {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwardAlertHistory {
    pub id: u64,
    pub rule_id: RuleId,
    pub node_id: NodeId,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub acknowledged: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub acknowledged_at: Option<OffsetDateTime>,
    pub acknowledged_by: Option<String>,
}

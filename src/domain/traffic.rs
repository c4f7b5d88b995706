use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::{LinkStatus, NodeId, RuleId};

/// Point-in-time report pushed by an agent for one relay process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwardStat {
    pub rule_id: RuleId,
    pub node_id: NodeId,
    pub port: u16,
    pub status: LinkStatus,
    pub traffic_in_bytes: u64,
    pub traffic_out_bytes: u64,
    pub bps_in: f64,
    pub bps_out: f64,
    pub latency_ms: u64,
    pub active_connections: u64,
}

impl ForwardStat {
    pub fn total_bytes(&self) -> u64 {
        self.traffic_in_bytes.saturating_add(self.traffic_out_bytes)
    }
}

/// Last observed reachability of a relay, keyed by (rule, node).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub updated_at: OffsetDateTime,
}

impl NodeHealth {
    pub fn now(healthy: bool, latency_ms: u64) -> Self {
        Self {
            healthy,
            latency_ms,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Cumulative byte counters read from the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSample {
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub in_packets: u64,
    pub out_packets: u64,
}

/// Time-bucketed traffic aggregate kept by the control plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwardTrafficHistory {
    pub rule_id: RuleId,
    pub node_id: NodeId,
    #[serde(with = "time::serde::rfc3339")]
    pub bucket_start: OffsetDateTime,
    pub traffic_in: u64,
    pub traffic_out: u64,
    pub samples: u32,
}

impl ForwardTrafficHistory {
    pub fn delta(&self) -> u64 {
        self.traffic_in.saturating_add(self.traffic_out)
    }
}

pub mod alert;
pub mod rule;
pub mod task;
pub mod traffic;
pub mod wire;

#[cfg(test)]
mod rule_tests;
#[cfg(test)]
mod task_tests;

use serde::{Deserialize, Serialize};

pub type RuleId = u64;
pub type NodeId = u64;

/// Identity of one supervised relay process.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessKey {
    pub rule_id: RuleId,
    pub node_id: NodeId,
}

impl ProcessKey {
    pub const fn new(rule_id: RuleId, node_id: NodeId) -> Self {
        Self { rule_id, node_id }
    }

    pub fn file_stem(&self) -> String {
        format!("realm_{}_{}", self.rule_id, self.node_id)
    }
}

impl std::fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.rule_id, self.node_id)
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Both,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl Protocol {
    pub const fn transports(self) -> &'static [Transport] {
        match self {
            Self::Tcp => &[Transport::Tcp],
            Self::Udp => &[Transport::Udp],
            Self::Both => &[Transport::Tcp, Transport::Udp],
        }
    }

    /// Transport used when a single dial has to stand for the whole rule.
    pub const fn probe_transport(self) -> Transport {
        match self {
            Self::Udp => Transport::Udp,
            Self::Tcp | Self::Both => Transport::Tcp,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Both => "both",
        }
    }
}

/// Tri-state link classification, ordered from best to worst.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    #[default]
    Healthy,
    Degraded,
    Faulty,
}

impl LinkStatus {
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Faulty => "faulty",
        }
    }
}

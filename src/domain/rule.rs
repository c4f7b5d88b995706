use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{NodeId, Protocol, RuleId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Direct,
    RelayGroup,
    Chain,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Priority,
    RoundRobin,
    IpHash,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    pub node_id: NodeId,
    #[serde(default)]
    pub port_spec: String,
    #[serde(default)]
    pub current_port: Option<u16>,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopType {
    Direct,
    RelayGroup,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainHop {
    pub hop_type: HopType,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub port_spec: String,
    #[serde(default)]
    pub relay_nodes: Vec<RelayNode>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub entry_node_id: NodeId,
    #[serde(default)]
    pub entry_port: Option<u16>,
    #[serde(default)]
    pub target_address: String,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub relay_nodes: Vec<RelayNode>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub hops: Vec<ChainHop>,
    #[serde(default)]
    pub health_check_target: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub id: RuleId,
    pub name: String,
    pub rule_type: RuleType,
    pub protocol: Protocol,
    pub config: RuleConfig,
    #[serde(default)]
    pub active_relay_node_id: Option<NodeId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("node {node_id} is not a relay of rule {rule_id}")]
    UnknownRelay { rule_id: RuleId, node_id: NodeId },
}

impl ForwardRule {
    pub fn is_entry(&self, node_id: NodeId) -> bool {
        self.config.entry_node_id == node_id
    }

    pub fn uses_priority_failover(&self) -> bool {
        self.rule_type == RuleType::RelayGroup
            && self.config.strategy.unwrap_or_default() == Strategy::Priority
            && !self.config.relay_nodes.is_empty()
    }

    /// Relay candidates in preference order.
    pub fn ordered_relays(&self) -> Vec<&RelayNode> {
        let mut relays: Vec<&RelayNode> = self.config.relay_nodes.iter().collect();
        relays.sort_by_key(|relay| relay.sort_order);
        relays
    }

    pub fn has_relay(&self, node_id: NodeId) -> bool {
        self.config
            .relay_nodes
            .iter()
            .any(|relay| relay.node_id == node_id)
    }

    pub fn set_active_relay(&mut self, node_id: NodeId) -> Result<(), RuleError> {
        if !self.has_relay(node_id) {
            return Err(RuleError::UnknownRelay {
                rule_id: self.id,
                node_id,
            });
        }
        self.active_relay_node_id = Some(node_id);
        Ok(())
    }

    /// Every node that runs a relay process for this rule.
    pub fn participating_nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.config.entry_node_id];
        match self.rule_type {
            RuleType::Direct => {}
            RuleType::RelayGroup => {
                nodes.extend(self.config.relay_nodes.iter().map(|relay| relay.node_id));
            }
            RuleType::Chain => {
                for hop in &self.config.hops {
                    nodes.extend(hop.node_id);
                    nodes.extend(hop.relay_nodes.iter().map(|relay| relay.node_id));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        nodes.retain(|node| seen.insert(*node));
        nodes
    }
}

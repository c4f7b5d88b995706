use super::rule::{
    ChainHop, ForwardRule, HopType, RelayNode, RuleConfig, RuleError, RuleType, Strategy,
};
use super::{NodeId, Protocol};

fn relay(node_id: NodeId, sort_order: i32) -> RelayNode {
    RelayNode {
        node_id,
        port_spec: "20000-20010".to_string(),
        current_port: None,
        sort_order,
    }
}

fn group_rule() -> ForwardRule {
    ForwardRule {
        id: 7,
        name: "edge".to_string(),
        rule_type: RuleType::RelayGroup,
        protocol: Protocol::Tcp,
        config: RuleConfig {
            entry_node_id: 1,
            relay_nodes: vec![relay(10, 2), relay(11, 0), relay(12, 1)],
            strategy: Some(Strategy::Priority),
            ..RuleConfig::default()
        },
        active_relay_node_id: None,
    }
}

#[test]
fn orders_relays_by_sort_order() {
    let rule = group_rule();
    let order: Vec<NodeId> = rule.ordered_relays().iter().map(|r| r.node_id).collect();
    assert_eq!(order, vec![11, 12, 10]);
}

#[test]
fn rejects_unknown_active_relay() {
    let mut rule = group_rule();
    assert!(rule.set_active_relay(12).is_ok());
    assert_eq!(rule.active_relay_node_id, Some(12));
    assert_eq!(
        rule.set_active_relay(99),
        Err(RuleError::UnknownRelay {
            rule_id: 7,
            node_id: 99
        })
    );
    assert_eq!(rule.active_relay_node_id, Some(12));
}

#[test]
fn unknown_strategy_is_not_priority() {
    let raw = r#"{"id":1,"name":"x","rule_type":"relay_group","protocol":"both",
        "config":{"entry_node_id":1,"relay_nodes":[{"node_id":2}],"strategy":"least_load"}}"#;
    let rule: ForwardRule = serde_json::from_str(raw).expect("rule");
    assert_eq!(rule.config.strategy, Some(Strategy::Other));
    assert!(!rule.uses_priority_failover());
}

#[test]
fn chain_nodes_are_deduplicated() {
    let rule = ForwardRule {
        id: 3,
        name: "chain".to_string(),
        rule_type: RuleType::Chain,
        protocol: Protocol::Udp,
        config: RuleConfig {
            entry_node_id: 1,
            hops: vec![
                ChainHop {
                    hop_type: HopType::Direct,
                    node_id: Some(2),
                    port_spec: String::new(),
                    relay_nodes: Vec::new(),
                    strategy: None,
                },
                ChainHop {
                    hop_type: HopType::RelayGroup,
                    node_id: None,
                    port_spec: String::new(),
                    relay_nodes: vec![relay(2, 0), relay(4, 1)],
                    strategy: Some(Strategy::Priority),
                },
            ],
            ..RuleConfig::default()
        },
        active_relay_node_id: None,
    };
    assert_eq!(rule.participating_nodes(), vec![1, 2, 4]);
}

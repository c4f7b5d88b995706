use serde_json::json;

use super::task::{RealmTarget, TaskError, TaskRequest, TaskType};
use super::wire::{Frame, TaskEnvelope};
use super::Protocol;

fn envelope(task_type: &str, payload: serde_json::Value) -> TaskEnvelope {
    TaskEnvelope {
        task_id: "t-1".to_string(),
        task_type: task_type.to_string(),
        payload,
    }
}

#[test]
fn decodes_start_request_with_failover_plan() {
    let env = envelope(
        "START_REALM",
        json!({
            "rule_id": 4,
            "node_id": 1,
            "protocol": "both",
            "port": 30000,
            "config": "[[endpoints]]",
            "is_entry": true,
            "failover": {
                "candidates": [
                    {"node_id": 8, "sort_order": 1, "address": "10.0.0.8:20000"},
                    {"node_id": 9, "sort_order": 0, "address": "10.0.0.9:20000"}
                ],
                "configs": {"8": "cfg-8", "9": "cfg-9"},
                "active_relay_node_id": 9
            }
        }),
    );
    let TaskRequest::StartRealm(request) = TaskRequest::decode(&env).expect("decode") else {
        panic!("expected start request");
    };
    assert_eq!(request.protocol, Protocol::Both);
    let plan = request.priority_plan().expect("priority plan");
    assert_eq!(plan.configs.get(&8).map(String::as_str), Some("cfg-8"));
    assert_eq!(plan.active_relay_node_id, Some(9));
    assert!(request.watched_link().is_none());
}

#[test]
fn non_entry_requests_never_carry_a_plan() {
    let env = envelope(
        "UPDATE_REALM",
        json!({
            "rule_id": 4, "node_id": 2, "port": 20000, "config": "",
            "link_check": {"next_hop": "10.0.0.3:1"},
            "failover": {"candidates": [{"node_id": 8, "address": "a:1"}], "configs": {}}
        }),
    );
    let TaskRequest::UpdateRealm(request) = TaskRequest::decode(&env).expect("decode") else {
        panic!("expected update request");
    };
    assert!(request.priority_plan().is_none());
    assert!(request.watched_link().is_none());
}

#[test]
fn unknown_task_type_is_rejected() {
    let err = TaskRequest::decode(&envelope("REBOOT", json!({}))).unwrap_err();
    assert!(matches!(err, TaskError::UnknownType(kind) if kind == "REBOOT"));
}

#[test]
fn malformed_payload_names_the_task() {
    let err = TaskRequest::decode(&envelope("STOP_REALM", json!({"rule_id": "x"}))).unwrap_err();
    assert!(matches!(
        err,
        TaskError::InvalidPayload {
            task_type: TaskType::StopRealm,
            ..
        }
    ));
}

#[test]
fn prepare_env_accepts_empty_payload() {
    let request = TaskRequest::decode(&envelope("PREPARE_FORWARD_ENV", json!(null))).unwrap();
    assert_eq!(request.task_type(), TaskType::PrepareForwardEnv);
}

#[test]
fn envelope_survives_the_wire() {
    let env = TaskRequest::StopRealm(RealmTarget {
        rule_id: 3,
        node_id: 5,
    })
    .into_envelope("abc".to_string())
    .expect("envelope");
    assert_eq!(env.task_type, "STOP_REALM");

    let line = Frame::Task(env.clone()).encode().expect("encode");
    assert!(line.ends_with('\n'));
    assert!(line.contains("\"type\":\"task\""));
    assert_eq!(Frame::decode(&line).expect("decode"), Frame::Task(env));
}

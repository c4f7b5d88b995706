use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::rule::Strategy;
use crate::domain::wire::TaskEnvelope;
use crate::domain::{NodeId, ProcessKey, Protocol, RuleId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    CheckPort,
    PrepareForwardEnv,
    StartRealm,
    StopRealm,
    UpdateRealm,
    GetRealmLog,
    ClearRealmLog,
    DeleteRealmLog,
    TestConnectivity,
}

impl TaskType {
    pub const ALL: [Self; 9] = [
        Self::CheckPort,
        Self::PrepareForwardEnv,
        Self::StartRealm,
        Self::StopRealm,
        Self::UpdateRealm,
        Self::GetRealmLog,
        Self::ClearRealmLog,
        Self::DeleteRealmLog,
        Self::TestConnectivity,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CheckPort => "CHECK_PORT",
            Self::PrepareForwardEnv => "PREPARE_FORWARD_ENV",
            Self::StartRealm => "START_REALM",
            Self::StopRealm => "STOP_REALM",
            Self::UpdateRealm => "UPDATE_REALM",
            Self::GetRealmLog => "GET_REALM_LOG",
            Self::ClearRealmLog => "CLEAR_REALM_LOG",
            Self::DeleteRealmLog => "DELETE_REALM_LOG",
            Self::TestConnectivity => "TEST_CONNECTIVITY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPortRequest {
    pub port_spec: String,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareEnvRequest {
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub protocol: Protocol,
    /// Turns the host firewall on or off when set.
    #[serde(default)]
    pub firewall_enabled: Option<bool>,
}

/// Next-hop and end-to-end targets watched from the entry node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCheck {
    #[serde(default)]
    pub next_hop: Option<String>,
    #[serde(default)]
    pub end_to_end: Option<String>,
}

impl LinkCheck {
    pub fn is_configured(&self) -> bool {
        self.next_hop.is_some() || self.end_to_end.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCandidate {
    pub node_id: NodeId,
    #[serde(default)]
    pub sort_order: i32,
    /// `host:port` the entry process would forward to.
    pub address: String,
}

/// Priority group data pre-rendered by the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverPlan {
    #[serde(default)]
    pub strategy: Strategy,
    pub candidates: Vec<RelayCandidate>,
    /// Relay configuration text per candidate node.
    pub configs: HashMap<NodeId, String>,
    #[serde(default)]
    pub active_relay_node_id: Option<NodeId>,
}

impl FailoverPlan {
    pub fn is_priority(&self) -> bool {
        self.strategy == Strategy::Priority && !self.candidates.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub rule_id: RuleId,
    pub node_id: NodeId,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    /// Rendered relay configuration; opaque to the supervisor.
    pub config: String,
    #[serde(default)]
    pub is_entry: bool,
    #[serde(default)]
    pub link_check: Option<LinkCheck>,
    #[serde(default)]
    pub failover: Option<FailoverPlan>,
    #[serde(default)]
    pub crash_limit: Option<u32>,
}

impl StartRequest {
    pub const fn key(&self) -> ProcessKey {
        ProcessKey::new(self.rule_id, self.node_id)
    }

    pub fn watched_link(&self) -> Option<&LinkCheck> {
        if !self.is_entry {
            return None;
        }
        self.link_check.as_ref().filter(|check| check.is_configured())
    }

    pub fn priority_plan(&self) -> Option<&FailoverPlan> {
        if !self.is_entry {
            return None;
        }
        self.failover.as_ref().filter(|plan| plan.is_priority())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmTarget {
    pub rule_id: RuleId,
    pub node_id: NodeId,
}

impl RealmTarget {
    pub const fn key(&self) -> ProcessKey {
        ProcessKey::new(self.rule_id, self.node_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmLogRequest {
    pub rule_id: RuleId,
    pub node_id: NodeId,
    #[serde(default)]
    pub lines: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityRequest {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Closed set of agent tasks, decoded once at the connection boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskRequest {
    CheckPort(CheckPortRequest),
    PrepareForwardEnv(PrepareEnvRequest),
    StartRealm(Box<StartRequest>),
    StopRealm(RealmTarget),
    UpdateRealm(Box<StartRequest>),
    GetRealmLog(RealmLogRequest),
    ClearRealmLog(RealmTarget),
    DeleteRealmLog(RealmTarget),
    TestConnectivity(ConnectivityRequest),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task type {0:?}")]
    UnknownType(String),
    #[error("invalid {task_type} payload: {source}")]
    InvalidPayload {
        task_type: TaskType,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {task_type} payload: {source}")]
    Encode {
        task_type: TaskType,
        #[source]
        source: serde_json::Error,
    },
}

impl TaskRequest {
    pub const fn task_type(&self) -> TaskType {
        match self {
            Self::CheckPort(_) => TaskType::CheckPort,
            Self::PrepareForwardEnv(_) => TaskType::PrepareForwardEnv,
            Self::StartRealm(_) => TaskType::StartRealm,
            Self::StopRealm(_) => TaskType::StopRealm,
            Self::UpdateRealm(_) => TaskType::UpdateRealm,
            Self::GetRealmLog(_) => TaskType::GetRealmLog,
            Self::ClearRealmLog(_) => TaskType::ClearRealmLog,
            Self::DeleteRealmLog(_) => TaskType::DeleteRealmLog,
            Self::TestConnectivity(_) => TaskType::TestConnectivity,
        }
    }

    pub fn decode(envelope: &TaskEnvelope) -> Result<Self, TaskError> {
        let task_type = TaskType::parse(&envelope.task_type)
            .ok_or_else(|| TaskError::UnknownType(envelope.task_type.clone()))?;
        let payload = &envelope.payload;
        let request = match task_type {
            TaskType::CheckPort => Self::CheckPort(payload_as(task_type, payload)?),
            TaskType::PrepareForwardEnv => {
                if payload.is_null() {
                    Self::PrepareForwardEnv(PrepareEnvRequest::default())
                } else {
                    Self::PrepareForwardEnv(payload_as(task_type, payload)?)
                }
            }
            TaskType::StartRealm => Self::StartRealm(Box::new(payload_as(task_type, payload)?)),
            TaskType::StopRealm => Self::StopRealm(payload_as(task_type, payload)?),
            TaskType::UpdateRealm => Self::UpdateRealm(Box::new(payload_as(task_type, payload)?)),
            TaskType::GetRealmLog => Self::GetRealmLog(payload_as(task_type, payload)?),
            TaskType::ClearRealmLog => Self::ClearRealmLog(payload_as(task_type, payload)?),
            TaskType::DeleteRealmLog => Self::DeleteRealmLog(payload_as(task_type, payload)?),
            TaskType::TestConnectivity => Self::TestConnectivity(payload_as(task_type, payload)?),
        };
        Ok(request)
    }

    pub fn into_envelope(self, task_id: String) -> Result<TaskEnvelope, TaskError> {
        let task_type = self.task_type();
        let payload = match &self {
            Self::CheckPort(req) => serde_json::to_value(req),
            Self::PrepareForwardEnv(req) => serde_json::to_value(req),
            Self::StartRealm(req) | Self::UpdateRealm(req) => serde_json::to_value(req),
            Self::StopRealm(req) | Self::ClearRealmLog(req) | Self::DeleteRealmLog(req) => {
                serde_json::to_value(req)
            }
            Self::GetRealmLog(req) => serde_json::to_value(req),
            Self::TestConnectivity(req) => serde_json::to_value(req),
        }
        .map_err(|source| TaskError::Encode { task_type, source })?;
        Ok(TaskEnvelope {
            task_id,
            task_type: task_type.as_str().to_string(),
            payload,
        })
    }
}

fn payload_as<T: DeserializeOwned>(
    task_type: TaskType,
    payload: &serde_json::Value,
) -> Result<T, TaskError> {
    T::deserialize(payload).map_err(|source| TaskError::InvalidPayload { task_type, source })
}

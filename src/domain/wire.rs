use serde::{Deserialize, Serialize};

use crate::domain::traffic::ForwardStat;
use crate::domain::{NodeId, RuleId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskResult {
    pub task_id: String,
    pub node_id: NodeId,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AgentTaskResult {
    pub fn ok(task_id: &str, node_id: NodeId, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            node_id,
            success: true,
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn failure(task_id: &str, node_id: NodeId, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            node_id,
            success: false,
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// One line on the agent/control connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        node_id: NodeId,
        version: String,
    },
    Task(TaskEnvelope),
    Result(AgentTaskResult),
    Stat(ForwardStat),
    RelaySwitched {
        rule_id: RuleId,
        node_id: NodeId,
        previous: Option<NodeId>,
    },
}

impl Frame {
    pub fn encode(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end())
    }
}

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::app::failover::{FailoverController, FailoverRegistry};
use crate::app::supervisor::{ProcessSupervisor, SupervisorError};
use crate::domain::task::{
    CheckPortRequest, ConnectivityRequest, PrepareEnvRequest, RealmLogRequest, RealmTarget,
    StartRequest, TaskRequest,
};
use crate::domain::wire::{AgentTaskResult, TaskEnvelope};
use crate::domain::{NodeId, ProcessKey};
use crate::infra::connection::FrameSink;
use crate::infra::firewall::{FirewallError, HostFirewall, PortFirewall};
use crate::infra::process::command_exists;
use crate::support::constants::DEFAULT_LOG_LINES;
use crate::support::logging::{clear_log, remove_if_exists, tail_log};
use crate::support::ports::{first_available, PortSpecError};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    PortSpec(#[from] PortSpecError),
    #[error("no free port in {0}")]
    NoFreePort(String),
    #[error(transparent)]
    Firewall(#[from] FirewallError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("relay {0} is running; stop it first")]
    Running(ProcessKey),
}

struct Outcome {
    message: String,
    payload: serde_json::Value,
}

impl Outcome {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Executes control-plane tasks against the local supervisor.
pub struct TaskHandler {
    node_id: NodeId,
    supervisor: ProcessSupervisor,
    failover: Arc<FailoverRegistry>,
    firewall: HostFirewall,
    socket_tool: String,
    sink: Option<Arc<dyn FrameSink>>,
    stop_timeout: Duration,
}

impl TaskHandler {
    pub fn new(
        node_id: NodeId,
        supervisor: ProcessSupervisor,
        failover: Arc<FailoverRegistry>,
        firewall: HostFirewall,
        sink: Option<Arc<dyn FrameSink>>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            supervisor,
            failover,
            firewall,
            socket_tool: "ss".to_string(),
            sink,
            stop_timeout,
        }
    }

    pub fn handle(&self, envelope: &TaskEnvelope) -> AgentTaskResult {
        let request = match TaskRequest::decode(envelope) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(task_id = %envelope.task_id, error = %err, "rejecting task");
                return AgentTaskResult::failure(&envelope.task_id, self.node_id, err.to_string());
            }
        };
        let task_type = request.task_type();
        tracing::debug!(task_id = %envelope.task_id, task_type = %task_type, "handling task");
        match self.execute(request) {
            Ok(outcome) => AgentTaskResult::ok(&envelope.task_id, self.node_id, outcome.message)
                .with_payload(outcome.payload),
            Err(err) => {
                tracing::warn!(
                    task_id = %envelope.task_id,
                    task_type = %task_type,
                    error = %err,
                    "task failed"
                );
                AgentTaskResult::failure(&envelope.task_id, self.node_id, err.to_string())
            }
        }
    }

    fn execute(&self, request: TaskRequest) -> Result<Outcome, ExecutionError> {
        match request {
            TaskRequest::CheckPort(req) => check_port(&req),
            TaskRequest::PrepareForwardEnv(req) => self.prepare(&req),
            TaskRequest::StartRealm(req) => self.start(*req),
            TaskRequest::StopRealm(target) => Ok(self.stop(target)),
            TaskRequest::UpdateRealm(req) => self.update(*req),
            TaskRequest::GetRealmLog(req) => self.read_log(req),
            TaskRequest::ClearRealmLog(target) => self.clear_log(target),
            TaskRequest::DeleteRealmLog(target) => self.delete_log(target),
            TaskRequest::TestConnectivity(req) => Ok(self.test_connectivity(&req)),
        }
    }

    fn prepare(&self, req: &PrepareEnvRequest) -> Result<Outcome, ExecutionError> {
        let config = self.supervisor.config();
        for dir in [&config.config_dir, &config.log_dir] {
            fs::create_dir_all(dir).map_err(|source| ExecutionError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        if let Some(enabled) = req.firewall_enabled {
            self.firewall.set_enabled(enabled)?;
        }
        for port in &req.ports {
            self.firewall.open_port(*port, req.protocol)?;
        }
        let payload = json!({
            "relay_bin_found": command_exists(&config.relay_bin),
            "socket_tool_found": command_exists(&self.socket_tool),
            "firewall": self.firewall.backend().as_str(),
            "firewall_enabled": self.firewall.is_enabled(),
        });
        Ok(Outcome::new("environment ready").with_payload(payload))
    }

    fn start(&self, request: StartRequest) -> Result<Outcome, ExecutionError> {
        self.failover.stop(request.rule_id);
        let controller = FailoverController::new(
            &request,
            self.supervisor.clone(),
            self.sink.clone(),
            self.stop_timeout,
        );
        let process = self
            .supervisor
            .start(request, self.sink.clone(), self.stop_timeout)?;
        if let Some(controller) = controller {
            self.failover
                .start(controller, self.supervisor.config().health_interval);
        }
        Ok(Outcome::new(format!("relay started with pid {}", process.pid()))
            .with_payload(json!({ "pid": process.pid(), "port": process.port() })))
    }

    fn update(&self, request: StartRequest) -> Result<Outcome, ExecutionError> {
        self.failover.stop(request.rule_id);
        let controller = FailoverController::new(
            &request,
            self.supervisor.clone(),
            self.sink.clone(),
            self.stop_timeout,
        );
        let process = self
            .supervisor
            .update(request, self.sink.clone(), self.stop_timeout)?;
        if let Some(controller) = controller {
            self.failover
                .start(controller, self.supervisor.config().health_interval);
        }
        Ok(Outcome::new(format!("relay updated with pid {}", process.pid()))
            .with_payload(json!({ "pid": process.pid(), "port": process.port() })))
    }

    fn stop(&self, target: RealmTarget) -> Outcome {
        self.failover.stop(target.rule_id);
        self.supervisor.stop(target.key(), self.stop_timeout);
        Outcome::new("relay stopped")
    }

    fn read_log(&self, req: RealmLogRequest) -> Result<Outcome, ExecutionError> {
        let path = self
            .supervisor
            .log_path(ProcessKey::new(req.rule_id, req.node_id));
        let lines = match tail_log(&path, req.lines.unwrap_or(DEFAULT_LOG_LINES)) {
            Ok(lines) => lines,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(ExecutionError::Io { path, source }),
        };
        Ok(Outcome::new(format!("{} lines", lines.len())).with_payload(json!({ "lines": lines })))
    }

    fn clear_log(&self, target: RealmTarget) -> Result<Outcome, ExecutionError> {
        let path = self.supervisor.log_path(target.key());
        clear_log(&path).map_err(|source| ExecutionError::Io { path, source })?;
        Ok(Outcome::new("log cleared"))
    }

    fn delete_log(&self, target: RealmTarget) -> Result<Outcome, ExecutionError> {
        let key = target.key();
        if self.supervisor.is_registered(key) {
            return Err(ExecutionError::Running(key));
        }
        for path in [self.supervisor.log_path(key), self.supervisor.config_path(key)] {
            remove_if_exists(&path).map_err(|source| ExecutionError::Io { path, source })?;
        }
        Ok(Outcome::new("log deleted"))
    }

    fn test_connectivity(&self, req: &ConnectivityRequest) -> Outcome {
        let address = format!("{}:{}", req.host, req.port);
        let config = self.supervisor.config();
        let result = self.supervisor.tools().prober.probe(
            &address,
            req.protocol.probe_transport(),
            config.probe_timeout,
        );
        let message = if result.reachable {
            format!("{address} reachable in {} ms", result.latency_ms)
        } else {
            format!("{address} unreachable")
        };
        Outcome::new(message).with_payload(json!({
            "reachable": result.reachable,
            "latency_ms": result.latency_ms,
        }))
    }
}

fn check_port(req: &CheckPortRequest) -> Result<Outcome, ExecutionError> {
    match first_available(&req.port_spec, req.protocol)? {
        Some(port) => Ok(Outcome::new(format!("port {port} is free")).with_payload(json!({ "port": port }))),
        None => Err(ExecutionError::NoFreePort(req.port_spec.clone())),
    }
}

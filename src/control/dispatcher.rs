use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::domain::task::{TaskError, TaskRequest};
use crate::domain::wire::{AgentTaskResult, Frame};
use crate::domain::NodeId;
use crate::infra::connection::FrameSink;
use crate::support::run::new_task_id;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("node {0} is offline")]
    Offline(NodeId),
    #[error("task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },
    #[error("cannot send task {task_id}: {source}")]
    Send {
        task_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Encode(#[from] TaskError),
}

/// Live agent connections by node.
pub trait ConnectionRegistry: Send + Sync {
    fn connected_clients(&self) -> HashMap<NodeId, Arc<dyn FrameSink>>;
}

type Slot = (Sender<AgentTaskResult>, Receiver<AgentTaskResult>);

/// Correlates asynchronous agent results with waiting callers.
///
/// A result is delivered at most once: whichever side removes the waiter
/// from the map owns the outcome.
#[derive(Default)]
pub struct Dispatcher {
    waiters: Mutex<HashMap<String, Slot>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the single-slot channel for `task_id` and returns its receiver.
    pub fn register_waiter(&self, task_id: &str) -> Receiver<AgentTaskResult> {
        let mut waiters = self.waiters();
        let (_, receiver) = waiters
            .entry(task_id.to_string())
            .or_insert_with(|| bounded(1));
        receiver.clone()
    }

    pub fn has_waiter(&self, task_id: &str) -> bool {
        self.waiters().contains_key(task_id)
    }

    pub fn pending(&self) -> usize {
        self.waiters().len()
    }

    pub fn wait_result(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<AgentTaskResult, DispatchError> {
        let receiver = self
            .waiters()
            .get(task_id)
            .map(|(_, receiver)| receiver.clone());
        match receiver {
            Some(receiver) => self.wait_on(task_id, &receiver, timeout),
            None => Err(DispatchError::Timeout {
                task_id: task_id.to_string(),
                timeout,
            }),
        }
    }

    /// Returns false when nobody waits for `result.task_id`.
    pub fn complete_result(&self, result: AgentTaskResult) -> bool {
        let mut waiters = self.waiters();
        let Some((sender, _)) = waiters.remove(&result.task_id) else {
            tracing::debug!(task_id = %result.task_id, "dropping result without waiter");
            return false;
        };
        // Sent under the lock so a timed-out waiter that lost the removal
        // race always finds the result queued.
        sender.try_send(result).is_ok()
    }

    fn wait_on(
        &self,
        task_id: &str,
        receiver: &Receiver<AgentTaskResult>,
        timeout: Duration,
    ) -> Result<AgentTaskResult, DispatchError> {
        match receiver.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                let timed_out = || DispatchError::Timeout {
                    task_id: task_id.to_string(),
                    timeout,
                };
                if self.waiters().remove(task_id).is_some() {
                    return Err(timed_out());
                }
                receiver.try_recv().map_err(|_| timed_out())
            }
        }
    }

    /// Sends `request` to `node_id` and blocks for its result.
    ///
    /// Offline nodes, send failures and timeouts come back as failed results.
    pub fn send_task_to_node(
        &self,
        registry: &dyn ConnectionRegistry,
        node_id: NodeId,
        request: TaskRequest,
        timeout: Duration,
    ) -> AgentTaskResult {
        let task_id = new_task_id();
        match self.dispatch(registry, node_id, request, &task_id, timeout) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(node_id, task_id = %task_id, error = %err, "task dispatch failed");
                AgentTaskResult::failure(&task_id, node_id, err.to_string())
            }
        }
    }

    fn dispatch(
        &self,
        registry: &dyn ConnectionRegistry,
        node_id: NodeId,
        request: TaskRequest,
        task_id: &str,
        timeout: Duration,
    ) -> Result<AgentTaskResult, DispatchError> {
        let connection = registry
            .connected_clients()
            .remove(&node_id)
            .ok_or(DispatchError::Offline(node_id))?;
        let envelope = request.into_envelope(task_id.to_string())?;
        let receiver = self.register_waiter(task_id);
        if let Err(source) = connection.send_frame(&Frame::Task(envelope)) {
            self.waiters().remove(task_id);
            return Err(DispatchError::Send {
                task_id: task_id.to_string(),
                source,
            });
        }
        self.wait_on(task_id, &receiver, timeout)
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

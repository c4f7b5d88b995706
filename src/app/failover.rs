use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};

use crate::app::health::HealthCache;
use crate::app::supervisor::ProcessSupervisor;
use crate::domain::task::{RelayCandidate, StartRequest};
use crate::domain::wire::Frame;
use crate::domain::{NodeId, ProcessKey, RuleId};
use crate::infra::connection::FrameSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    Keep,
    Switch(NodeId),
    /// No candidate is healthy; the active relay stays in place.
    NoneHealthy,
}

/// Picks the relay the entry process should forward to.
///
/// `candidates` must be ordered by preference.
pub fn select_relay(
    candidates: &[RelayCandidate],
    active: Option<NodeId>,
    is_healthy: impl Fn(NodeId) -> bool,
) -> Selection {
    if active.is_some_and(&is_healthy) {
        return Selection::Keep;
    }
    match candidates
        .iter()
        .find(|candidate| is_healthy(candidate.node_id))
    {
        Some(candidate) if Some(candidate.node_id) == active => Selection::Keep,
        Some(candidate) => Selection::Switch(candidate.node_id),
        None => Selection::NoneHealthy,
    }
}

/// Priority failover for one rule's entry process.
pub struct FailoverController {
    key: ProcessKey,
    candidates: Vec<RelayCandidate>,
    configs: HashMap<NodeId, String>,
    active: Mutex<Option<NodeId>>,
    request: Mutex<StartRequest>,
    health: Arc<HealthCache>,
    supervisor: ProcessSupervisor,
    sink: Option<Arc<dyn FrameSink>>,
    stop_timeout: Duration,
    evaluating: Mutex<()>,
}

impl FailoverController {
    /// Returns `None` unless `request` is an entry process with a priority plan.
    pub fn new(
        request: &StartRequest,
        supervisor: ProcessSupervisor,
        sink: Option<Arc<dyn FrameSink>>,
        stop_timeout: Duration,
    ) -> Option<Self> {
        let plan = request.priority_plan()?;
        let mut candidates = plan.candidates.clone();
        candidates.sort_by_key(|candidate| candidate.sort_order);
        Some(Self {
            key: request.key(),
            candidates,
            configs: plan.configs.clone(),
            active: Mutex::new(plan.active_relay_node_id),
            request: Mutex::new(request.clone()),
            health: supervisor.health(),
            supervisor,
            sink,
            stop_timeout,
            evaluating: Mutex::new(()),
        })
    }

    pub fn rule_id(&self) -> RuleId {
        self.key.rule_id
    }

    pub fn active(&self) -> Option<NodeId> {
        *lock(&self.active)
    }

    /// Runs one evaluation; returns the decision taken, or `None` when another
    /// evaluation for this rule is still in flight.
    pub fn evaluate(&self) -> Option<Selection> {
        let Ok(_guard) = self.evaluating.try_lock() else {
            return None;
        };
        let active = self.active();
        let rule_id = self.key.rule_id;
        let selection = select_relay(&self.candidates, active, |node_id| {
            self.health.is_healthy(ProcessKey::new(rule_id, node_id))
        });
        match selection {
            Selection::Keep => {}
            Selection::NoneHealthy => {
                tracing::warn!(
                    rule_id,
                    active = ?active,
                    "no healthy relay candidate; keeping the active relay"
                );
            }
            Selection::Switch(next) => {
                if !self.switch_to(next, active) {
                    return Some(Selection::Keep);
                }
            }
        }
        Some(selection)
    }

    fn switch_to(&self, next: NodeId, previous: Option<NodeId>) -> bool {
        let rule_id = self.key.rule_id;
        let Some(config) = self.configs.get(&next) else {
            tracing::warn!(rule_id, relay = next, "no rendered config for relay candidate");
            return false;
        };
        let request = {
            let mut request = lock(&self.request);
            request.config.clone_from(config);
            if let Some(plan) = request.failover.as_mut() {
                plan.active_relay_node_id = Some(next);
            }
            request.clone()
        };
        if let Err(err) = self
            .supervisor
            .update(request, self.sink.clone(), self.stop_timeout)
        {
            tracing::error!(rule_id, relay = next, error = %err, "failover reconfiguration failed");
            return false;
        }
        *lock(&self.active) = Some(next);
        tracing::info!(rule_id, from = ?previous, to = next, "switched active relay");
        if let Some(sink) = &self.sink {
            let frame = Frame::RelaySwitched {
                rule_id,
                node_id: next,
                previous,
            };
            if let Err(err) = sink.send_frame(&frame) {
                tracing::warn!(rule_id, error = %err, "relay switch not reported");
            }
        }
        true
    }
}

struct LoopHandle {
    stop: Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// One failover loop per rule.
#[derive(Default)]
pub struct FailoverRegistry {
    loops: Mutex<HashMap<RuleId, LoopHandle>>,
}

impl FailoverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any loop for the same rule, waiting for the old one to exit.
    pub fn start(&self, controller: FailoverController, interval: Duration) {
        let rule_id = controller.rule_id();
        self.stop(rule_id);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let thread = thread::spawn(move || run_loop(&controller, interval, &stop_rx));
        let previous = self.loops().insert(
            rule_id,
            LoopHandle {
                stop: stop_tx,
                thread,
            },
        );
        if let Some(previous) = previous {
            previous.join();
        }
        tracing::debug!(rule_id, "failover loop started");
    }

    pub fn stop(&self, rule_id: RuleId) {
        let handle = self.loops().remove(&rule_id);
        if let Some(handle) = handle {
            handle.join();
            tracing::debug!(rule_id, "failover loop stopped");
        }
    }

    pub fn stop_all(&self) {
        let handles: Vec<LoopHandle> = self.loops().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.join();
        }
    }

    pub fn is_running(&self, rule_id: RuleId) -> bool {
        self.loops().contains_key(&rule_id)
    }

    fn loops(&self) -> MutexGuard<'_, HashMap<RuleId, LoopHandle>> {
        lock(&self.loops)
    }
}

impl LoopHandle {
    fn join(self) {
        drop(self.stop);
        let _ = self.thread.join();
    }
}

fn run_loop(controller: &FailoverController, interval: Duration, stop: &Receiver<()>) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {
                controller.evaluate();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

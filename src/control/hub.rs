use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use time::OffsetDateTime;

use crate::control::alerts::AlertEvaluator;
use crate::control::dispatcher::{ConnectionRegistry, Dispatcher};
use crate::control::events::{ControlEvent, EventHub};
use crate::control::history::TrafficRecorder;
use crate::control::store::{ControlStore, StoreError};
use crate::domain::alert::ForwardAlertHistory;
use crate::domain::task::TaskRequest;
use crate::domain::traffic::ForwardStat;
use crate::domain::wire::{AgentTaskResult, Frame};
use crate::domain::{NodeId, RuleId};
use crate::infra::connection::{read_frames, FrameSink, LineConnection};

struct HubState {
    clients: Mutex<HashMap<NodeId, Arc<LineConnection>>>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn ControlStore>,
    recorder: TrafficRecorder,
    alerts: AlertEvaluator,
    events: Arc<EventHub>,
    stop_event: Arc<AtomicBool>,
}

/// Control-plane endpoint that agents connect to.
pub struct ControlHub {
    state: Arc<HubState>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl ControlHub {
    pub fn start(
        bind: impl ToSocketAddrs,
        store: Arc<dyn ControlStore>,
        events: Arc<EventHub>,
        bucket_secs: i64,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let state = Arc::new(HubState {
            clients: Mutex::new(HashMap::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            recorder: TrafficRecorder::new(Arc::clone(&store), bucket_secs),
            alerts: AlertEvaluator::new(Arc::clone(&store), Arc::clone(&events)),
            store,
            events,
            stop_event: Arc::new(AtomicBool::new(false)),
        });
        let accept_state = Arc::clone(&state);
        let handle = thread::spawn(move || accept_loop(&listener, &accept_state));
        tracing::info!(%addr, "control hub listening");
        Ok(Self {
            state,
            handle: Some(handle),
            addr,
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.state.dispatcher)
    }

    pub fn events(&self) -> Arc<EventHub> {
        Arc::clone(&self.state.events)
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.state.clients().contains_key(&node_id)
    }

    /// Sends `request` to `node_id` and waits up to `timeout` for the reply.
    pub fn send_task(
        &self,
        node_id: NodeId,
        request: TaskRequest,
        timeout: Duration,
    ) -> AgentTaskResult {
        self.state
            .dispatcher
            .send_task_to_node(self, node_id, request, timeout)
    }

    pub fn acknowledge_alert(
        &self,
        alert_id: u64,
        by: &str,
        at: OffsetDateTime,
    ) -> Result<ForwardAlertHistory, StoreError> {
        self.state.alerts.acknowledge_alert(alert_id, by, at)
    }

    pub fn stop(&mut self) {
        self.state.stop_event.store(true, Ordering::SeqCst);
        let clients: Vec<Arc<LineConnection>> =
            self.state.clients().drain().map(|(_, conn)| conn).collect();
        for connection in clients {
            connection.detach();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ControlHub {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ConnectionRegistry for ControlHub {
    fn connected_clients(&self) -> HashMap<NodeId, Arc<dyn FrameSink>> {
        self.state
            .clients()
            .iter()
            .map(|(node_id, conn)| (*node_id, Arc::clone(conn) as Arc<dyn FrameSink>))
            .collect()
    }
}

fn accept_loop(listener: &TcpListener, state: &Arc<HubState>) {
    while !state.stop_event.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = Arc::clone(state);
                thread::spawn(move || {
                    if let Err(err) = handle_agent(stream, &state) {
                        tracing::warn!(%peer, error = %err, "agent connection error");
                    }
                });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                tracing::error!(error = %err, "control hub accept failed");
                break;
            }
        }
    }
}

fn handle_agent(stream: TcpStream, state: &HubState) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let reader = stream.try_clone()?;
    let connection = Arc::new(LineConnection::attached(stream));
    let mut node: Option<NodeId> = None;
    read_frames(reader, &state.stop_event, |frame| match frame {
        Frame::Hello { node_id, version } => {
            state.register(node_id, &connection, &version);
            node = Some(node_id);
        }
        Frame::Result(result) => {
            state.dispatcher.complete_result(result);
        }
        Frame::Stat(stat) => state.record_stat(&stat),
        Frame::RelaySwitched {
            rule_id,
            node_id,
            previous,
        } => state.record_switch(rule_id, node_id, previous),
        Frame::Task(envelope) => {
            tracing::warn!(task_id = %envelope.task_id, "agent sent a task frame; ignoring");
        }
    });
    if let Some(node_id) = node {
        state.unregister(node_id, &connection);
    }
    Ok(())
}

impl HubState {
    fn clients(&self) -> MutexGuard<'_, HashMap<NodeId, Arc<LineConnection>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, node_id: NodeId, connection: &Arc<LineConnection>, version: &str) {
        let previous = self.clients().insert(node_id, Arc::clone(connection));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, connection) {
                previous.detach();
            }
        }
        tracing::info!(node_id, version, "agent connected");
        self.events.publish(ControlEvent::NodeConnected { node_id });
    }

    fn unregister(&self, node_id: NodeId, connection: &Arc<LineConnection>) {
        let removed = {
            let mut clients = self.clients();
            let current = clients
                .get(&node_id)
                .is_some_and(|conn| Arc::ptr_eq(conn, connection));
            if current {
                clients.remove(&node_id);
            }
            current
        };
        if removed {
            tracing::info!(node_id, "agent disconnected");
            self.events
                .publish(ControlEvent::NodeDisconnected { node_id });
        }
    }

    fn record_stat(&self, stat: &ForwardStat) {
        let now = OffsetDateTime::now_utc();
        let sample = match self.recorder.record(stat, now) {
            Ok(sample) => sample,
            Err(err) => {
                tracing::warn!(rule_id = stat.rule_id, node_id = stat.node_id, error = %err, "cannot record traffic");
                return;
            }
        };
        if let Err(err) = self
            .alerts
            .evaluate(stat, sample.delta(), &sample.history, now)
        {
            tracing::warn!(rule_id = stat.rule_id, error = %err, "alert evaluation failed");
        }
    }

    fn record_switch(&self, rule_id: RuleId, node_id: NodeId, previous: Option<NodeId>) {
        match self.store.update_active_relay(rule_id, node_id) {
            Ok(()) => {
                tracing::info!(rule_id, node_id, previous = ?previous, "active relay updated");
                self.events.publish(ControlEvent::RelaySwitched {
                    rule_id,
                    node_id,
                    previous,
                });
            }
            Err(err) => {
                tracing::warn!(rule_id, node_id, error = %err, "rejected relay switch");
            }
        }
    }
}

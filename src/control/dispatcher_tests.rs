use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::dispatcher::{ConnectionRegistry, DispatchError, Dispatcher};
use crate::domain::task::{RealmTarget, TaskRequest};
use crate::domain::wire::{AgentTaskResult, Frame};
use crate::domain::NodeId;
use crate::infra::connection::FrameSink;

/// Agent stand-in that answers every task synchronously.
struct EchoAgent {
    node_id: NodeId,
    dispatcher: Arc<Dispatcher>,
    seen: Mutex<Vec<String>>,
}

impl FrameSink for EchoAgent {
    fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        let Frame::Task(envelope) = frame else {
            return Ok(());
        };
        self.seen.lock().unwrap().push(envelope.task_type.clone());
        self.dispatcher.complete_result(AgentTaskResult::ok(
            &envelope.task_id,
            self.node_id,
            "done",
        ));
        Ok(())
    }
}

struct SilentAgent;

impl FrameSink for SilentAgent {
    fn send_frame(&self, _frame: &Frame) -> io::Result<()> {
        Ok(())
    }
}

struct BrokenAgent;

impl FrameSink for BrokenAgent {
    fn send_frame(&self, _frame: &Frame) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
    }
}

#[derive(Default)]
struct Registry {
    clients: HashMap<NodeId, Arc<dyn FrameSink>>,
}

impl ConnectionRegistry for Registry {
    fn connected_clients(&self) -> HashMap<NodeId, Arc<dyn FrameSink>> {
        self.clients.clone()
    }
}

fn stop_request() -> TaskRequest {
    TaskRequest::StopRealm(RealmTarget {
        rule_id: 1,
        node_id: 2,
    })
}

#[test]
fn result_reaches_the_waiting_caller() {
    let dispatcher = Arc::new(Dispatcher::new());
    let agent = Arc::new(EchoAgent {
        node_id: 2,
        dispatcher: Arc::clone(&dispatcher),
        seen: Mutex::new(Vec::new()),
    });
    let mut registry = Registry::default();
    registry
        .clients
        .insert(2, Arc::clone(&agent) as Arc<dyn FrameSink>);

    let result = dispatcher.send_task_to_node(&registry, 2, stop_request(), Duration::from_secs(1));

    assert!(result.success, "{}", result.message);
    assert_eq!(result.node_id, 2);
    assert_eq!(agent.seen.lock().unwrap().as_slice(), ["STOP_REALM"]);
    assert_eq!(dispatcher.pending(), 0);
}

#[test]
fn offline_node_fails_without_waiting() {
    let dispatcher = Dispatcher::new();

    let result = dispatcher.send_task_to_node(
        &Registry::default(),
        9,
        stop_request(),
        Duration::from_secs(30),
    );

    assert!(!result.success);
    assert!(result.message.contains("offline"));
    assert_eq!(dispatcher.pending(), 0);
}

#[test]
fn send_failure_leaves_no_waiter() {
    let dispatcher = Dispatcher::new();
    let mut registry = Registry::default();
    registry.clients.insert(3, Arc::new(BrokenAgent));

    let result = dispatcher.send_task_to_node(&registry, 3, stop_request(), Duration::from_secs(1));

    assert!(!result.success);
    assert_eq!(dispatcher.pending(), 0);
}

#[test]
fn timeout_removes_the_waiter() {
    let dispatcher = Dispatcher::new();
    let mut registry = Registry::default();
    registry.clients.insert(4, Arc::new(SilentAgent));

    let result =
        dispatcher.send_task_to_node(&registry, 4, stop_request(), Duration::from_millis(50));

    assert!(!result.success);
    assert!(result.message.contains("timed out"));
    assert_eq!(dispatcher.pending(), 0);
}

#[test]
fn result_is_delivered_at_most_once() {
    let dispatcher = Dispatcher::new();
    let receiver = dispatcher.register_waiter("t-1");

    assert!(dispatcher.complete_result(AgentTaskResult::ok("t-1", 1, "first")));
    assert!(!dispatcher.complete_result(AgentTaskResult::ok("t-1", 1, "second")));

    assert!(!dispatcher.has_waiter("t-1"));
    assert_eq!(receiver.try_recv().expect("result").message, "first");
    assert!(receiver.try_recv().is_err());
}

#[test]
fn unknown_task_result_is_dropped() {
    let dispatcher = Dispatcher::new();

    assert!(!dispatcher.complete_result(AgentTaskResult::ok("nobody", 1, "late")));
}

#[test]
fn waiting_caller_receives_result_from_another_thread() {
    let dispatcher = Arc::new(Dispatcher::new());
    let _receiver = dispatcher.register_waiter("t-2");
    let completer = Arc::clone(&dispatcher);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        completer.complete_result(AgentTaskResult::ok("t-2", 1, "done"))
    });

    let result = dispatcher
        .wait_result("t-2", Duration::from_secs(5))
        .expect("result");

    assert!(handle.join().expect("join"));
    assert_eq!(result.message, "done");
    assert_eq!(dispatcher.pending(), 0);
}

#[test]
fn late_result_after_timeout_is_refused() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register_waiter("t-3");

    let err = dispatcher
        .wait_result("t-3", Duration::from_millis(20))
        .expect_err("timeout");
    assert!(matches!(err, DispatchError::Timeout { .. }));

    let late = Arc::clone(&dispatcher);
    let accepted = thread::spawn(move || late.complete_result(AgentTaskResult::ok("t-3", 1, "late")))
        .join()
        .expect("join");
    assert!(!accepted);
}

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::domain::alert::ForwardAlertHistory;
use crate::domain::{NodeId, RuleId};
use crate::support::constants::{CLIENT_QUEUE_SIZE, EVENT_HISTORY_LIMIT};

/// Operator-visible notification.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEvent {
    Alert(ForwardAlertHistory),
    RelaySwitched {
        rule_id: RuleId,
        node_id: NodeId,
        previous: Option<NodeId>,
    },
    NodeConnected {
        node_id: NodeId,
    },
    NodeDisconnected {
        node_id: NodeId,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: ControlEvent,
}

struct EventHubState {
    history: VecDeque<SequencedEvent>,
    clients: Vec<(usize, Sender<SequencedEvent>)>,
    next_client_id: usize,
}

/// Fan-out of control events with a bounded replay history.
///
/// Slow subscribers miss events rather than blocking publishers.
pub struct EventHub {
    state: Mutex<EventHubState>,
    seq: AtomicU64,
    history_size: usize,
}

impl EventHub {
    pub fn new(history_size: usize) -> Self {
        Self {
            state: Mutex::new(EventHubState {
                history: VecDeque::with_capacity(history_size),
                clients: Vec::new(),
                next_client_id: 1,
            }),
            seq: AtomicU64::new(0),
            history_size,
        }
    }

    pub fn publish(&self, event: ControlEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = SequencedEvent { seq, event };
        let clients = {
            let mut state = self.state();
            state.history.push_back(event.clone());
            while state.history.len() > self.history_size {
                state.history.pop_front();
            }
            state.clients.clone()
        };
        let mut disconnected = HashSet::new();
        for (id, sender) in clients {
            if let Err(TrySendError::Disconnected(_)) = sender.try_send(event.clone()) {
                disconnected.insert(id);
            }
        }
        if !disconnected.is_empty() {
            self.state()
                .clients
                .retain(|(id, _)| !disconnected.contains(id));
        }
        seq
    }

    /// New subscription plus the retained history at the time of joining.
    pub fn subscribe(&self) -> (Receiver<SequencedEvent>, Vec<SequencedEvent>) {
        let (sender, receiver) = bounded(CLIENT_QUEUE_SIZE);
        let mut state = self.state();
        let id = state.next_client_id;
        state.next_client_id += 1;
        state.clients.push((id, sender));
        let history = state.history.iter().cloned().collect();
        (receiver, history)
    }

    pub fn history(&self) -> Vec<SequencedEvent> {
        self.state().history.iter().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, EventHubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(EVENT_HISTORY_LIMIT)
    }
}

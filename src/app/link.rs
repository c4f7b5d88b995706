use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};

use crate::domain::task::LinkCheck;
use crate::domain::{LinkStatus, ProcessKey, Transport};
use crate::infra::probe::Prober;

/// Classifies a link from its next-hop and optional end-to-end probes.
pub fn classify(next_hop_reachable: bool, end_to_end_reachable: Option<bool>) -> LinkStatus {
    match end_to_end_reachable {
        Some(true) => LinkStatus::Healthy,
        Some(false) if next_hop_reachable => LinkStatus::Degraded,
        Some(false) => LinkStatus::Faulty,
        None if next_hop_reachable => LinkStatus::Healthy,
        None => LinkStatus::Faulty,
    }
}

/// Periodic reachability watch attached to an entry-node process.
pub struct LinkHealthMonitor {
    key: ProcessKey,
    check: LinkCheck,
    transport: Transport,
    prober: Arc<dyn Prober>,
    timeout: Duration,
    status: Mutex<LinkStatus>,
    stop: Mutex<Option<Sender<()>>>,
}

impl LinkHealthMonitor {
    pub fn new(
        key: ProcessKey,
        check: LinkCheck,
        transport: Transport,
        prober: Arc<dyn Prober>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            check,
            transport,
            prober,
            timeout,
            status: Mutex::new(LinkStatus::Healthy),
            stop: Mutex::new(None),
        })
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Probes both targets once and stores the classification.
    pub fn check_now(&self) -> LinkStatus {
        // Without a next hop the end-to-end target is the only path we know of.
        let next_hop = match (&self.check.next_hop, &self.check.end_to_end) {
            (Some(addr), _) => self.reachable(addr),
            (None, Some(_)) => false,
            (None, None) => true,
        };
        let end_to_end = self.check.end_to_end.as_deref().map(|addr| self.reachable(addr));
        let status = classify(next_hop, end_to_end);
        let previous = {
            let mut guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, status)
        };
        if previous != status {
            tracing::info!(
                rule_id = self.key.rule_id,
                node_id = self.key.node_id,
                from = previous.as_str(),
                to = status.as_str(),
                "link status changed"
            );
        }
        status
    }

    fn reachable(&self, address: &str) -> bool {
        self.prober
            .probe(address, self.transport, self.timeout)
            .reachable
    }

    /// Runs one check immediately, then every `interval` until stopped.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        {
            let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
            if stop.is_some() {
                return;
            }
            *stop = Some(stop_tx);
        }
        let monitor = Arc::clone(self);
        thread::spawn(move || monitor.run(interval, &stop_rx));
    }

    fn run(&self, interval: Duration, stop: &Receiver<()>) {
        self.check_now();
        let ticker = tick(interval);
        loop {
            select! {
                recv(stop) -> _ => break,
                recv(ticker) -> _ => {
                    self.check_now();
                }
            }
        }
    }

    pub fn stop(&self) {
        self.stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Status reported by an optional monitor; `None` when nothing is attached.
pub fn monitored_status(monitor: Option<&LinkHealthMonitor>) -> Option<LinkStatus> {
    monitor.map(LinkHealthMonitor::status)
}

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick, Receiver, TryRecvError};

use crate::app::health::HealthCache;
use crate::app::link::{monitored_status, LinkHealthMonitor};
use crate::app::supervisor::HostTools;
use crate::domain::task::RelayCandidate;
use crate::domain::traffic::{CounterSample, ForwardStat, NodeHealth};
use crate::domain::wire::Frame;
use crate::domain::{LinkStatus, ProcessKey, Protocol};
use crate::infra::connection::FrameSink;
use crate::infra::probe::local_address;
use crate::support::rate::{bits_per_second, Ewma};

pub struct StatsTarget {
    pub key: ProcessKey,
    pub port: u16,
    pub protocol: Protocol,
    pub probe_timeout: Duration,
    pub ewma_alpha: f64,
    /// Relay candidates whose reachability feeds priority failover.
    pub candidates: Vec<RelayCandidate>,
}

/// Turns host readings into one `ForwardStat` per tick.
pub struct StatsSampler {
    target: StatsTarget,
    tools: HostTools,
    health: Arc<HealthCache>,
    link: Option<Arc<LinkHealthMonitor>>,
    baseline: Option<(Instant, CounterSample)>,
    bps_in: Ewma,
    bps_out: Ewma,
}

impl StatsSampler {
    pub fn new(
        target: StatsTarget,
        tools: HostTools,
        health: Arc<HealthCache>,
        link: Option<Arc<LinkHealthMonitor>>,
    ) -> Self {
        let alpha = target.ewma_alpha;
        Self {
            target,
            tools,
            health,
            link,
            baseline: None,
            bps_in: Ewma::new(alpha),
            bps_out: Ewma::new(alpha),
        }
    }

    pub fn sample(&mut self, now: Instant) -> ForwardStat {
        let key = self.target.key;
        let probe = self.tools.prober.probe(
            &local_address(self.target.port),
            self.target.protocol.probe_transport(),
            self.target.probe_timeout,
        );
        self.health
            .record(key, NodeHealth::now(probe.reachable, probe.latency_ms));
        self.probe_candidates();

        let probed = if probe.reachable {
            LinkStatus::Healthy
        } else {
            LinkStatus::Faulty
        };
        let status = monitored_status(self.link.as_deref())
            .map_or(probed, |linked| probed.worst(linked));

        let counters = match self.tools.counters.read(
            key.rule_id,
            self.target.port,
            self.target.protocol,
        ) {
            Ok(sample) => Some(sample),
            Err(err) => {
                tracing::debug!(rule_id = key.rule_id, port = self.target.port, error = %err, "counter read failed");
                None
            }
        };
        let (bps_in, bps_out) = self.rates(now, counters);
        let counters = counters.unwrap_or_default();

        ForwardStat {
            rule_id: key.rule_id,
            node_id: key.node_id,
            port: self.target.port,
            status,
            traffic_in_bytes: counters.in_bytes,
            traffic_out_bytes: counters.out_bytes,
            bps_in,
            bps_out,
            latency_ms: probe.latency_ms,
            active_connections: self
                .tools
                .sockets
                .active_connections(self.target.port, self.target.protocol),
        }
    }

    /// A failed read reports zero for this tick and keeps the previous baseline.
    fn rates(&mut self, now: Instant, counters: Option<CounterSample>) -> (f64, f64) {
        let Some(current) = counters else {
            return (0.0, 0.0);
        };
        let rates = match self.baseline {
            Some((at, previous)) => {
                let elapsed = now.saturating_duration_since(at);
                let inbound = bits_per_second(previous.in_bytes, current.in_bytes, elapsed);
                let outbound = bits_per_second(previous.out_bytes, current.out_bytes, elapsed);
                (self.bps_in.update(inbound), self.bps_out.update(outbound))
            }
            None => (0.0, 0.0),
        };
        self.baseline = Some((now, current));
        rates
    }

    fn probe_candidates(&self) {
        let transport = self.target.protocol.probe_transport();
        for candidate in &self.target.candidates {
            let result =
                self.tools
                    .prober
                    .probe(&candidate.address, transport, self.target.probe_timeout);
            self.health.record(
                ProcessKey::new(self.target.key.rule_id, candidate.node_id),
                NodeHealth::now(result.reachable, result.latency_ms),
            );
        }
    }
}

/// Samples every `interval` and pushes the stat until `stop` closes.
pub fn spawn_stats_loop(
    mut sampler: StatsSampler,
    sink: Arc<dyn FrameSink>,
    interval: Duration,
    stop: Receiver<()>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let ticker = tick(interval);
        loop {
            select! {
                recv(stop) -> _ => break,
                recv(ticker) -> msg => {
                    let Ok(at) = msg else { break };
                    let stat = sampler.sample(at);
                    if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
                        break;
                    }
                    if let Err(err) = sink.send_frame(&Frame::Stat(stat)) {
                        tracing::debug!(
                            rule_id = sampler.target.key.rule_id,
                            error = %err,
                            "stat not delivered"
                        );
                    }
                }
            }
        }
    })
}

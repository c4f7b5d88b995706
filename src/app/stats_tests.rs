use std::sync::Arc;
use std::time::{Duration, Instant};

use super::health::HealthCache;
use super::link::LinkHealthMonitor;
use super::stats::{StatsSampler, StatsTarget};
use super::test_support::{fake_tools, Fakes};
use crate::domain::task::{LinkCheck, RelayCandidate};
use crate::domain::traffic::CounterSample;
use crate::domain::{LinkStatus, ProcessKey, Protocol, Transport};
use crate::infra::probe::local_address;

const PORT: u16 = 32000;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

fn counters(in_bytes: u64, out_bytes: u64) -> CounterSample {
    CounterSample {
        in_bytes,
        out_bytes,
        ..CounterSample::default()
    }
}

fn target(candidates: Vec<RelayCandidate>) -> StatsTarget {
    StatsTarget {
        key: ProcessKey::new(5, 1),
        port: PORT,
        protocol: Protocol::Tcp,
        probe_timeout: Duration::from_millis(10),
        ewma_alpha: 0.3,
        candidates,
    }
}

fn sampler(
    candidates: Vec<RelayCandidate>,
    link: Option<Arc<LinkHealthMonitor>>,
) -> (StatsSampler, Fakes, Arc<HealthCache>) {
    let (tools, fakes) = fake_tools();
    let health = Arc::new(HealthCache::new());
    let sampler = StatsSampler::new(target(candidates), tools, Arc::clone(&health), link);
    (sampler, fakes, health)
}

#[test]
fn rates_start_at_zero_then_follow_counter_growth() {
    let (mut sampler, fakes, _) = sampler(Vec::new(), None);
    fakes.prober.set(&local_address(PORT), true);
    fakes.counters.push(Ok(counters(1000, 2000)));
    fakes.counters.push(Ok(counters(2250, 2000)));
    let start = Instant::now();

    let first = sampler.sample(start);
    assert!(close(first.bps_in, 0.0));
    assert_eq!(first.traffic_in_bytes, 1000);
    assert_eq!(first.status, LinkStatus::Healthy);
    assert_eq!(first.latency_ms, 7);

    let second = sampler.sample(start + Duration::from_secs(10));
    assert!(close(second.bps_in, 1000.0));
    assert!(close(second.bps_out, 0.0));
    assert_eq!(second.active_connections, 3);
}

#[test]
fn failed_counter_read_keeps_previous_baseline() {
    let (mut sampler, fakes, _) = sampler(Vec::new(), None);
    fakes.counters.push(Ok(counters(1000, 0)));
    fakes.counters.push(Err("iptables unavailable".to_string()));
    fakes.counters.push(Ok(counters(2250, 0)));
    let start = Instant::now();

    sampler.sample(start);
    let failed = sampler.sample(start + Duration::from_secs(10));
    assert_eq!(failed.traffic_in_bytes, 0);
    assert!(close(failed.bps_in, 0.0));

    let recovered = sampler.sample(start + Duration::from_secs(20));
    assert_eq!(recovered.traffic_in_bytes, 2250);
    assert!(close(recovered.bps_in, 500.0));
}

#[test]
fn unreachable_listener_is_faulty() {
    let (mut sampler, _fakes, health) = sampler(Vec::new(), None);

    let stat = sampler.sample(Instant::now());

    assert_eq!(stat.status, LinkStatus::Faulty);
    assert!(!health.is_healthy(ProcessKey::new(5, 1)));
}

#[test]
fn link_monitor_can_downgrade_status() {
    let (tools, fakes) = fake_tools();
    fakes.prober.set(&local_address(PORT), true);
    fakes.prober.set("10.0.0.2:20000", true);
    let monitor = LinkHealthMonitor::new(
        ProcessKey::new(5, 1),
        LinkCheck {
            next_hop: Some("10.0.0.2:20000".to_string()),
            end_to_end: Some("10.9.9.9:443".to_string()),
        },
        Transport::Tcp,
        Arc::clone(&tools.prober),
        Duration::from_millis(10),
    );
    assert_eq!(monitor.check_now(), LinkStatus::Degraded);
    let mut sampler = StatsSampler::new(
        target(Vec::new()),
        tools,
        Arc::new(HealthCache::new()),
        Some(monitor),
    );

    assert_eq!(sampler.sample(Instant::now()).status, LinkStatus::Degraded);
}

#[test]
fn candidates_are_probed_into_health_cache() {
    let candidates = vec![
        RelayCandidate {
            node_id: 8,
            sort_order: 0,
            address: "10.0.0.8:20000".to_string(),
        },
        RelayCandidate {
            node_id: 9,
            sort_order: 1,
            address: "10.0.0.9:20000".to_string(),
        },
    ];
    let (mut sampler, fakes, health) = sampler(candidates, None);
    fakes.prober.set("10.0.0.9:20000", true);

    sampler.sample(Instant::now());

    assert!(!health.is_healthy(ProcessKey::new(5, 8)));
    assert!(health.is_healthy(ProcessKey::new(5, 9)));
}

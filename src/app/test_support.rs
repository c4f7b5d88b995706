use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::health::HealthCache;
use crate::app::supervisor::{HostTools, ProcessSupervisor, SupervisorConfig};
use crate::domain::traffic::CounterSample;
use crate::domain::wire::Frame;
use crate::domain::{Protocol, RuleId, Transport};
use crate::infra::connection::FrameSink;
use crate::infra::counter::{CounterError, TrafficCounters};
use crate::infra::firewall::{FirewallError, PortFirewall};
use crate::infra::probe::{ProbeResult, Prober};
use crate::infra::sockets::ConnectionCounter;

/// Counters that replay queued samples and remember setup/teardown calls.
/// With `fail_setup` set, setup records the call and then fails.
#[derive(Default)]
pub(crate) struct FakeCounters {
    pub(crate) samples: Mutex<Vec<Result<CounterSample, String>>>,
    pub(crate) setups: Mutex<Vec<(RuleId, u16)>>,
    pub(crate) teardowns: Mutex<Vec<(RuleId, u16)>>,
    pub(crate) fail_setup: AtomicBool,
}

impl FakeCounters {
    pub(crate) fn push(&self, sample: Result<CounterSample, String>) {
        self.samples.lock().unwrap().push(sample);
    }
}

impl TrafficCounters for FakeCounters {
    fn setup(&self, rule_id: RuleId, port: u16, _protocol: Protocol) -> Result<(), CounterError> {
        self.setups.lock().unwrap().push((rule_id, port));
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(CounterError::Parse(format!("RK-IN-{rule_id}-{port}")));
        }
        Ok(())
    }

    fn read(
        &self,
        _rule_id: RuleId,
        _port: u16,
        _protocol: Protocol,
    ) -> Result<CounterSample, CounterError> {
        let mut samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return Ok(CounterSample::default());
        }
        samples.remove(0).map_err(CounterError::Parse)
    }

    fn teardown(&self, rule_id: RuleId, port: u16, _protocol: Protocol) {
        self.teardowns.lock().unwrap().push((rule_id, port));
    }
}

#[derive(Default)]
pub(crate) struct OpenFirewall;

impl PortFirewall for OpenFirewall {
    fn open_port(&self, _port: u16, _protocol: Protocol) -> Result<(), FirewallError> {
        Ok(())
    }

    fn close_port(&self, _port: u16, _protocol: Protocol) -> Result<(), FirewallError> {
        Ok(())
    }
}

/// Reachability by exact address; unknown addresses are unreachable.
#[derive(Default)]
pub(crate) struct ScriptedProber {
    pub(crate) reachable: Mutex<HashMap<String, bool>>,
}

impl ScriptedProber {
    pub(crate) fn set(&self, address: &str, reachable: bool) {
        self.reachable
            .lock()
            .unwrap()
            .insert(address.to_string(), reachable);
    }
}

impl Prober for ScriptedProber {
    fn probe(&self, address: &str, _transport: Transport, _timeout: Duration) -> ProbeResult {
        let reachable = self
            .reachable
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(false);
        ProbeResult {
            reachable,
            latency_ms: if reachable { 7 } else { 0 },
        }
    }
}

pub(crate) struct FixedSockets(pub(crate) u64);

impl ConnectionCounter for FixedSockets {
    fn active_connections(&self, _port: u16, _protocol: Protocol) -> u64 {
        self.0
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) frames: Mutex<Vec<Frame>>,
}

impl FrameSink for RecordingSink {
    fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

pub(crate) struct Fakes {
    pub(crate) counters: Arc<FakeCounters>,
    pub(crate) prober: Arc<ScriptedProber>,
}

pub(crate) fn fake_tools() -> (HostTools, Fakes) {
    let counters = Arc::new(FakeCounters::default());
    let prober = Arc::new(ScriptedProber::default());
    let tools = HostTools {
        counters: Arc::clone(&counters) as Arc<dyn TrafficCounters>,
        firewall: Arc::new(OpenFirewall),
        prober: Arc::clone(&prober) as Arc<dyn Prober>,
        sockets: Arc::new(FixedSockets(3)),
    };
    (tools, Fakes { counters, prober })
}

/// Supervisor that launches `sh` with `script` in place of the relay.
pub(crate) fn sh_config(dir: &Path, script: &str, crash_limit: u32) -> SupervisorConfig {
    SupervisorConfig {
        config_dir: dir.join("conf"),
        log_dir: dir.join("log"),
        relay_bin: "sh".to_string(),
        relay_args: format!("-c {}", shell_words::quote(script)),
        crash_limit,
        restart_backoff: Duration::from_millis(20),
        stats_interval: Duration::from_millis(50),
        health_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(50),
        link_probe_timeout: Duration::from_millis(50),
        ewma_alpha: 0.3,
    }
}

pub(crate) fn sh_supervisor(
    dir: &Path,
    script: &str,
    crash_limit: u32,
) -> (ProcessSupervisor, Fakes) {
    let (tools, fakes) = fake_tools();
    let supervisor = ProcessSupervisor::new(
        sh_config(dir, script, crash_limit),
        tools,
        Arc::new(HealthCache::new()),
    );
    (supervisor, fakes)
}

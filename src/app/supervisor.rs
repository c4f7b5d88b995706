use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use time::OffsetDateTime;

use crate::app::health::HealthCache;
use crate::app::link::LinkHealthMonitor;
use crate::app::stats::{spawn_stats_loop, StatsSampler, StatsTarget};
use crate::domain::task::StartRequest;
use crate::domain::{ProcessKey, Protocol};
use crate::infra::connection::FrameSink;
use crate::infra::counter::{CounterError, IptablesCounters, TrafficCounters};
use crate::infra::firewall::{HostFirewall, PortFirewall};
use crate::infra::probe::{DialProber, Prober};
use crate::infra::process::{kill_group, spawn_process_group, terminate_group};
use crate::infra::sockets::{ConnectionCounter, SsCounter};
use crate::support::args::relay_command_args;
use crate::support::config::Settings;
use crate::support::logging::{append_marker, append_marker_to, open_append, remove_if_exists};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot prepare {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot set up traffic counters: {0}")]
    Counters(#[from] CounterError),
    #[error("invalid relay arguments: {0}")]
    Config(String),
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("relay {0} is already running")]
    AlreadyRunning(ProcessKey),
    #[error("relay {0} was stopped during restart")]
    Cancelled(ProcessKey),
}

/// Host collaborators shared by every supervised process.
#[derive(Clone)]
pub struct HostTools {
    pub counters: Arc<dyn TrafficCounters>,
    pub firewall: Arc<dyn PortFirewall>,
    pub prober: Arc<dyn Prober>,
    pub sockets: Arc<dyn ConnectionCounter>,
}

impl HostTools {
    pub fn system(settings: &Settings) -> Self {
        Self {
            counters: Arc::new(IptablesCounters::default()),
            firewall: Arc::new(HostFirewall::detect(settings.firewall)),
            prober: Arc::new(DialProber),
            sockets: Arc::new(SsCounter::default()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub relay_bin: String,
    pub relay_args: String,
    pub crash_limit: u32,
    pub restart_backoff: Duration,
    pub stats_interval: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub link_probe_timeout: Duration,
    pub ewma_alpha: f64,
}

impl From<&Settings> for SupervisorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            config_dir: settings.config_dir.clone(),
            log_dir: settings.log_dir.clone(),
            relay_bin: settings.relay_bin.clone(),
            relay_args: settings.relay_args.clone(),
            crash_limit: settings.crash_limit,
            restart_backoff: settings.restart_backoff(),
            stats_interval: settings.stats_interval(),
            health_interval: settings.health_check_interval(),
            probe_timeout: settings.probe_timeout(),
            link_probe_timeout: settings.link_probe_timeout(),
            ewma_alpha: settings.ewma_alpha,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    /// The subprocess has exited and a relaunch is pending after the
    /// backoff. The entry stays registered until the relaunch replaces it,
    /// so a stop issued during the backoff cancels the restart.
    Restarting,
}

impl ProcessState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
        }
    }
}

/// Loops that live exactly as long as one relay incarnation.
struct Telemetry {
    stats_stop: Option<Sender<()>>,
    link: Option<Arc<LinkHealthMonitor>>,
}

impl Telemetry {
    fn cancel(self) {
        drop(self.stats_stop);
        if let Some(link) = self.link {
            link.stop();
        }
    }
}

/// One launched relay subprocess. A crash-restart creates a new value.
///
/// A registered value is either alive or in [`ProcessState::Restarting`];
/// check [`RealmProcess::state`] before assuming a pid is running.
pub struct RealmProcess {
    key: ProcessKey,
    pid: u32,
    port: u16,
    protocol: Protocol,
    config_path: PathBuf,
    log_path: PathBuf,
    started_at: OffsetDateTime,
    crash_count: u32,
    crash_limit: u32,
    stopping: AtomicBool,
    exited: AtomicBool,
    state: Mutex<ProcessState>,
    telemetry: Mutex<Option<Telemetry>>,
    done: Receiver<()>,
}

impl RealmProcess {
    pub const fn key(&self) -> ProcessKey {
        self.key
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub const fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    pub const fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub const fn crash_limit(&self) -> u32 {
        self.crash_limit
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ProcessState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn cancel_telemetry(&self) {
        let telemetry = self
            .telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(telemetry) = telemetry {
            telemetry.cancel();
        }
    }
}

struct Inner {
    config: SupervisorConfig,
    tools: HostTools,
    health: Arc<HealthCache>,
    registry: Mutex<HashMap<ProcessKey, Arc<RealmProcess>>>,
}

/// Owns every relay subprocess on this node, at most one per key.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, tools: HostTools, health: Arc<HealthCache>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tools,
                health,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn tools(&self) -> &HostTools {
        &self.inner.tools
    }

    pub fn health(&self) -> Arc<HealthCache> {
        Arc::clone(&self.inner.health)
    }

    pub fn config_path(&self, key: ProcessKey) -> PathBuf {
        self.inner
            .config
            .config_dir
            .join(format!("{}.toml", key.file_stem()))
    }

    pub fn log_path(&self, key: ProcessKey) -> PathBuf {
        self.inner
            .config
            .log_dir
            .join(format!("{}.log", key.file_stem()))
    }

    pub fn get(&self, key: ProcessKey) -> Option<Arc<RealmProcess>> {
        self.registry().get(&key).cloned()
    }

    /// True while the key owns a subprocess, including the restart backoff
    /// after a crash.
    pub fn is_registered(&self, key: ProcessKey) -> bool {
        self.registry().contains_key(&key)
    }

    pub fn keys(&self) -> Vec<ProcessKey> {
        let mut keys: Vec<ProcessKey> = self.registry().keys().copied().collect();
        keys.sort_by_key(|key| (key.rule_id, key.node_id));
        keys
    }

    /// Launches the relay for `request`, stopping any incarnation already
    /// registered under the same key first.
    pub fn start(
        &self,
        request: StartRequest,
        sink: Option<Arc<dyn FrameSink>>,
        stop_timeout: Duration,
    ) -> Result<Arc<RealmProcess>, SupervisorError> {
        self.stop(request.key(), stop_timeout);
        self.launch(&request, sink, 0, None)
    }

    /// Stop followed by start with the new parameters.
    pub fn update(
        &self,
        request: StartRequest,
        sink: Option<Arc<dyn FrameSink>>,
        stop_timeout: Duration,
    ) -> Result<Arc<RealmProcess>, SupervisorError> {
        self.start(request, sink, stop_timeout)
    }

    /// Stops the relay registered under `key` and waits for its exit watcher.
    ///
    /// Unknown keys and repeated calls are no-ops; only the first caller
    /// signals the process group.
    pub fn stop(&self, key: ProcessKey, timeout: Duration) {
        let (process, first) = {
            let registry = self.registry();
            let Some(process) = registry.get(&key).cloned() else {
                return;
            };
            let first = !process.stopping.swap(true, Ordering::SeqCst);
            (process, first)
        };
        if !first {
            let _ = process.done.recv();
            return;
        }
        process.set_state(ProcessState::Stopping);
        process.cancel_telemetry();
        if !process.has_exited() {
            terminate_group(process.pid);
        }
        match process.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    rule_id = key.rule_id,
                    node_id = key.node_id,
                    pid = process.pid,
                    timeout_secs = timeout.as_secs_f64(),
                    "relay ignored termination; killing"
                );
                if !process.has_exited() {
                    kill_group(process.pid);
                }
                let _ = process.done.recv();
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
        }
        tracing::info!(rule_id = key.rule_id, node_id = key.node_id, "relay stopped");
    }

    pub fn stop_all(&self, timeout: Duration) {
        for key in self.keys() {
            self.stop(key, timeout);
        }
    }

    fn launch(
        &self,
        request: &StartRequest,
        sink: Option<Arc<dyn FrameSink>>,
        crash_count: u32,
        replacing: Option<&Arc<RealmProcess>>,
    ) -> Result<Arc<RealmProcess>, SupervisorError> {
        let config = &self.inner.config;
        let key = request.key();
        for dir in [&config.config_dir, &config.log_dir] {
            fs::create_dir_all(dir).map_err(|source| SupervisorError::Setup {
                path: dir.clone(),
                source,
            })?;
        }
        let config_path = self.config_path(key);
        fs::write(&config_path, &request.config).map_err(|source| SupervisorError::Setup {
            path: config_path.clone(),
            source,
        })?;
        let log_path = self.log_path(key);
        let setup_err = |source| SupervisorError::Setup {
            path: log_path.clone(),
            source,
        };
        let prepared = open_append(&log_path)
            .and_then(|log| Ok((log.try_clone()?, log.try_clone()?, log)))
            .map_err(setup_err)
            .and_then(|files| {
                relay_command_args(&config.relay_args, &config_path.to_string_lossy())
                    .map(|args| (files, args))
                    .map_err(SupervisorError::Config)
            });
        let ((stdout, stderr, mut log), args) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                let _ = remove_if_exists(&config_path);
                return Err(err);
            }
        };

        let tools = &self.inner.tools;
        if let Err(err) = tools
            .counters
            .setup(key.rule_id, request.port, request.protocol)
        {
            // setup may fail after creating some of the chains
            tools
                .counters
                .teardown(key.rule_id, request.port, request.protocol);
            let _ = remove_if_exists(&config_path);
            append_marker(&mut log, &format!("counter setup failed: {err}"));
            return Err(err.into());
        }
        if let Err(err) = tools.firewall.open_port(request.port, request.protocol) {
            tracing::warn!(port = request.port, error = %err, "cannot open firewall port");
        }

        let mut command = Command::new(&config.relay_bin);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        let mut child = match spawn_process_group(&mut command) {
            Ok(child) => child,
            Err(source) => {
                self.release_host(request);
                let _ = remove_if_exists(&config_path);
                append_marker(&mut log, &format!("launch failed: {source}"));
                return Err(SupervisorError::Launch {
                    program: config.relay_bin.clone(),
                    source,
                });
            }
        };
        let pid = child.id();
        let (done_tx, done_rx) = bounded::<()>(0);
        let process = Arc::new(RealmProcess {
            key,
            pid,
            port: request.port,
            protocol: request.protocol,
            config_path,
            log_path,
            started_at: OffsetDateTime::now_utc(),
            crash_count,
            crash_limit: request.crash_limit.unwrap_or(config.crash_limit),
            stopping: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            state: Mutex::new(ProcessState::Starting),
            telemetry: Mutex::new(None),
            done: done_rx,
        });

        if let Err(err) = self.register(&process, replacing) {
            kill_group(pid);
            let _ = child.wait();
            if !self.holds_host(request) {
                self.release_host(request);
            }
            append_marker(&mut log, &format!("pid {pid} discarded: {err}"));
            return Err(err);
        }

        append_marker(
            &mut log,
            &format!(
                "started pid {pid} on port {} (restarts {crash_count}/{})",
                request.port, process.crash_limit
            ),
        );
        process.set_state(ProcessState::Running);
        self.attach_telemetry(&process, request, sink.clone());
        tracing::info!(
            rule_id = key.rule_id,
            node_id = key.node_id,
            pid,
            port = request.port,
            crash_count,
            "relay started"
        );

        let supervisor = self.clone();
        let watched = Arc::clone(&process);
        let request = request.clone();
        thread::spawn(move || {
            supervisor.watch_exit(&watched, child, log, &request, sink);
            drop(done_tx);
        });
        Ok(process)
    }

    /// Inserts `process`, replacing `replacing` only while it is still the
    /// registered incarnation and nobody asked it to stop.
    fn register(
        &self,
        process: &Arc<RealmProcess>,
        replacing: Option<&Arc<RealmProcess>>,
    ) -> Result<(), SupervisorError> {
        let key = process.key;
        let mut registry = self.registry();
        match (registry.get(&key), replacing) {
            (None, None) => {}
            (Some(current), Some(old)) if Arc::ptr_eq(current, old) && !old.is_stopping() => {}
            (Some(_), None) => return Err(SupervisorError::AlreadyRunning(key)),
            _ => return Err(SupervisorError::Cancelled(key)),
        }
        registry.insert(key, Arc::clone(process));
        Ok(())
    }

    fn attach_telemetry(
        &self,
        process: &Arc<RealmProcess>,
        request: &StartRequest,
        sink: Option<Arc<dyn FrameSink>>,
    ) {
        let config = &self.inner.config;
        let tools = &self.inner.tools;
        let link = request.watched_link().map(|check| {
            let monitor = LinkHealthMonitor::new(
                process.key,
                check.clone(),
                request.protocol.probe_transport(),
                Arc::clone(&tools.prober),
                config.link_probe_timeout,
            );
            monitor.start(config.health_interval);
            monitor
        });
        let stats_stop = sink.map(|sink| {
            let (stop_tx, stop_rx) = bounded::<()>(0);
            let target = StatsTarget {
                key: process.key,
                port: request.port,
                protocol: request.protocol,
                probe_timeout: config.probe_timeout,
                ewma_alpha: config.ewma_alpha,
                candidates: request
                    .priority_plan()
                    .map(|plan| plan.candidates.clone())
                    .unwrap_or_default(),
            };
            let sampler = StatsSampler::new(
                target,
                tools.clone(),
                Arc::clone(&self.inner.health),
                link.clone(),
            );
            spawn_stats_loop(sampler, sink, config.stats_interval, stop_rx);
            stop_tx
        });
        *process
            .telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Telemetry { stats_stop, link });
    }

    fn watch_exit(
        &self,
        process: &Arc<RealmProcess>,
        mut child: Child,
        log: File,
        request: &StartRequest,
        sink: Option<Arc<dyn FrameSink>>,
    ) {
        let status = child.wait();
        process.exited.store(true, Ordering::SeqCst);
        drop(log);
        process.cancel_telemetry();
        let exit = describe_exit(&status);
        let key = process.key;

        if process.is_stopping() {
            self.finish(process, &format!("stopped ({exit})"));
            return;
        }
        if process.crash_count >= process.crash_limit {
            tracing::error!(
                rule_id = key.rule_id,
                node_id = key.node_id,
                pid = process.pid,
                exit = %exit,
                crash_limit = process.crash_limit,
                "relay exhausted its restart budget"
            );
            self.finish(
                process,
                &format!("exited ({exit}); restart limit {} reached", process.crash_limit),
            );
            return;
        }

        process.set_state(ProcessState::Crashed);
        let attempt = process.crash_count + 1;
        let backoff = self.inner.config.restart_backoff;
        tracing::warn!(
            rule_id = key.rule_id,
            node_id = key.node_id,
            pid = process.pid,
            exit = %exit,
            attempt,
            "relay crashed; restarting"
        );
        append_marker_to(
            &process.log_path,
            &format!(
                "crashed ({exit}); restart {attempt}/{} in {:.1}s",
                process.crash_limit,
                backoff.as_secs_f64()
            ),
        );
        process.set_state(ProcessState::Restarting);
        thread::sleep(backoff);
        if process.is_stopping() {
            self.finish(process, "stopped during restart backoff");
            return;
        }
        if let Err(err) = self.launch(request, sink, attempt, Some(process)) {
            tracing::error!(
                rule_id = key.rule_id,
                node_id = key.node_id,
                error = %err,
                "relay restart failed"
            );
            self.finish(process, &format!("restart failed: {err}"));
        }
    }

    /// Final cleanup for an incarnation that will not be replaced.
    fn finish(&self, process: &Arc<RealmProcess>, reason: &str) {
        let key = process.key;
        self.inner
            .tools
            .counters
            .teardown(key.rule_id, process.port, process.protocol);
        if let Err(err) = self
            .inner
            .tools
            .firewall
            .close_port(process.port, process.protocol)
        {
            tracing::warn!(port = process.port, error = %err, "cannot close firewall port");
        }
        {
            let mut registry = self.registry();
            if registry
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, process))
            {
                registry.remove(&key);
            }
        }
        process.set_state(ProcessState::Stopped);
        append_marker_to(&process.log_path, &format!("terminated: {reason}"));
        tracing::info!(
            rule_id = key.rule_id,
            node_id = key.node_id,
            pid = process.pid,
            reason,
            "relay terminated"
        );
    }

    /// True when a registered incarnation already uses the counters and
    /// port of `request`.
    fn holds_host(&self, request: &StartRequest) -> bool {
        self.registry().values().any(|process| {
            process.key.rule_id == request.rule_id
                && process.port == request.port
                && process.protocol == request.protocol
                && !process.is_stopping()
        })
    }

    fn release_host(&self, request: &StartRequest) {
        let tools = &self.inner.tools;
        tools
            .counters
            .teardown(request.rule_id, request.port, request.protocol);
        let _ = tools.firewall.close_port(request.port, request.protocol);
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ProcessKey, Arc<RealmProcess>>> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn describe_exit(status: &io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("exit code {code}"),
            None => format!("{status}"),
        },
        Err(err) => format!("wait failed: {err}"),
    }
}

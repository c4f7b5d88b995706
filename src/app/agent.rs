use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::app::failover::FailoverRegistry;
use crate::app::handler::TaskHandler;
use crate::app::health::HealthCache;
use crate::app::supervisor::{HostTools, ProcessSupervisor, SupervisorConfig};
use crate::domain::wire::{Frame, TaskEnvelope};
use crate::infra::connection::{read_frames, FrameSink, LineConnection};
use crate::infra::firewall::HostFirewall;
use crate::support::config::Settings;

/// Cloneable trigger handed to the signal thread.
#[derive(Clone)]
pub struct ShutdownSignal {
    stopped: Arc<AtomicBool>,
    wake: Arc<Mutex<Option<Sender<()>>>>,
    connection: Arc<LineConnection>,
}

impl ShutdownSignal {
    pub fn trigger(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutdown requested");
        self.wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.connection.detach();
    }

    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Node-side runtime: one control connection, one supervisor.
pub struct Agent {
    settings: Settings,
    connection: Arc<LineConnection>,
    supervisor: ProcessSupervisor,
    failover: Arc<FailoverRegistry>,
    handler: Arc<TaskHandler>,
    shutdown: ShutdownSignal,
    woken: Receiver<()>,
}

impl Agent {
    pub fn new(settings: Settings) -> Self {
        let tools = HostTools::system(&settings);
        let supervisor = ProcessSupervisor::new(
            SupervisorConfig::from(&settings),
            tools,
            Arc::new(HealthCache::new()),
        );
        let connection = Arc::new(LineConnection::detached());
        let failover = Arc::new(FailoverRegistry::new());
        let sink: Arc<dyn FrameSink> = Arc::clone(&connection) as Arc<dyn FrameSink>;
        let handler = Arc::new(TaskHandler::new(
            settings.node_id,
            supervisor.clone(),
            Arc::clone(&failover),
            HostFirewall::detect(settings.firewall),
            Some(sink),
            settings.stop_timeout(),
        ));
        let (wake_tx, woken) = bounded::<()>(0);
        let shutdown = ShutdownSignal {
            stopped: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Mutex::new(Some(wake_tx))),
            connection: Arc::clone(&connection),
        };
        Self {
            settings,
            connection,
            supervisor,
            failover,
            handler,
            shutdown,
            woken,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Serves the control connection until shutdown, then stops every relay.
    pub fn run(&self) {
        tracing::info!(
            node_id = self.settings.node_id,
            control = %self.settings.control_addr,
            "agent starting"
        );
        while !self.shutdown.is_triggered() {
            match TcpStream::connect(&self.settings.control_addr) {
                Ok(stream) => self.serve(stream),
                Err(err) => {
                    tracing::warn!(control = %self.settings.control_addr, error = %err, "cannot reach control plane");
                }
            }
            if self.shutdown.is_triggered() {
                break;
            }
            match self.woken.recv_timeout(self.settings.reconnect_backoff()) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.stop_everything();
    }

    fn serve(&self, stream: TcpStream) {
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(error = %err, "cannot clone control stream");
                return;
            }
        };
        self.connection.attach(stream);
        let hello = Frame::Hello {
            node_id: self.settings.node_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if let Err(err) = self.connection.send_frame(&hello) {
            tracing::warn!(error = %err, "handshake failed");
            self.connection.detach();
            return;
        }
        tracing::info!(control = %self.settings.control_addr, "connected to control plane");
        read_frames(reader, &self.shutdown.stopped, |frame| match frame {
            Frame::Task(envelope) => self.dispatch(envelope),
            other => tracing::debug!(frame = ?other, "ignoring frame"),
        });
        self.connection.detach();
        tracing::info!("control connection closed");
    }

    fn dispatch(&self, envelope: TaskEnvelope) {
        let handler = Arc::clone(&self.handler);
        let connection = Arc::clone(&self.connection);
        thread::spawn(move || {
            let result = handler.handle(&envelope);
            if let Err(err) = connection.send_frame(&Frame::Result(result)) {
                tracing::warn!(task_id = %envelope.task_id, error = %err, "task result not delivered");
            }
        });
    }

    fn stop_everything(&self) {
        self.failover.stop_all();
        self.supervisor.stop_all(self.settings.stop_timeout());
        tracing::info!("agent stopped");
    }
}

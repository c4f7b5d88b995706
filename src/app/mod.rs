pub mod agent;
pub mod failover;
pub mod handler;
pub mod health;
pub mod link;
pub mod stats;
pub mod supervisor;

#[cfg(test)]
mod link_tests;
#[cfg(test)]
mod stats_tests;
#[cfg(test)]
pub(crate) mod test_support;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use crate::support::args::{extract_config_arg, is_version_request};
use crate::support::config::Settings;
use crate::support::constants::BIN_NAME;
use crate::support::logging::init_tracing;

pub fn run() -> ExitCode {
    match run_inner() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err.message);
            ExitCode::from(err.code)
        }
    }
}

struct AppError {
    message: String,
    code: u8,
}

impl AppError {
    fn new(message: impl Into<String>, code: u8) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

fn run_inner() -> Result<(), AppError> {
    let args: Vec<String> = env::args().skip(1).collect();
    if is_version_request(&args) {
        print_version();
        return Ok(());
    }
    let (rest, config_path) = extract_config_arg(&args).map_err(|err| AppError::new(err, 2))?;
    if let Some(unexpected) = rest.first() {
        return Err(AppError::new(
            format!("Unexpected argument {unexpected:?}. Usage: {BIN_NAME} [--config <path>]"),
            2,
        ));
    }
    let config_path = config_path.or_else(|| env::var_os("RELAYKEEPER_CONFIG").map(PathBuf::from));
    let settings =
        Settings::load(config_path.as_deref()).map_err(|err| AppError::new(err.to_string(), 2))?;
    if settings.node_id == 0 {
        return Err(AppError::new(
            "node_id must be set (config file or RELAYKEEPER_NODE_ID).",
            2,
        ));
    }
    init_tracing(settings.log_level.as_deref());

    let agent = agent::Agent::new(settings);
    setup_signals(&agent)?;
    agent.run();
    Ok(())
}

fn setup_signals(agent: &agent::Agent) -> Result<(), AppError> {
    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|err| AppError::new(format!("cannot install signal handlers: {err}"), 1))?;
    let shutdown = agent.shutdown_signal();
    thread::spawn(move || {
        for _ in signals.forever() {
            shutdown.trigger();
        }
    });
    Ok(())
}

fn print_version() {
    let info = serde_json::json!({
        "name": BIN_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    });
    let mut stdout = io::stdout();
    let _ = writeln!(stdout, "{info}");
}

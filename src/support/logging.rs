use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::support::constants::{BIN_NAME, DEFAULT_LOG_FILTER, MAX_LOG_LINES};
use crate::support::run::timestamp;

/// Installs the global fmt subscriber.
///
/// `RELAYKEEPER_LOG` wins over the configured level.
pub(crate) fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_env("RELAYKEEPER_LOG")
        .ok()
        .or_else(|| level.and_then(|level| EnvFilter::try_new(level).ok()))
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub(crate) fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Appends a supervisor line next to the relay's own output.
pub(crate) fn append_marker(file: &mut File, message: &str) {
    let _ = writeln!(file, "[{BIN_NAME}] {} {message}", timestamp());
    let _ = file.flush();
}

pub(crate) fn append_marker_to(path: &Path, message: &str) {
    if let Ok(mut file) = open_append(path) {
        append_marker(&mut file, message);
    }
}

/// Last `lines` lines of a log file with terminal escapes removed.
pub(crate) fn tail_log(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let limit = lines.clamp(1, MAX_LOG_LINES);
    let reader = BufReader::new(File::open(path)?);
    let mut tail = VecDeque::with_capacity(limit);
    for line in reader.split(b'\n') {
        let mut line = line?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(strip_ansi_codes(&line));
    }
    Ok(tail.into_iter().collect())
}

pub(crate) fn clear_log(path: &Path) -> io::Result<()> {
    match OpenOptions::new().write(true).truncate(true).open(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub(crate) fn strip_ansi_codes(input: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(input);
    String::from_utf8_lossy(&stripped).into_owned()
}

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::wire::Frame;

/// Destination for frames written to the peer.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &Frame) -> io::Result<()>;
}

/// Writer half of a line-delimited JSON connection.
///
/// The stream can be swapped on reconnect; holders keep the same handle.
pub struct LineConnection {
    stream: Mutex<Option<TcpStream>>,
}

impl LineConnection {
    pub fn detached() -> Self {
        Self {
            stream: Mutex::new(None),
        }
    }

    pub fn attached(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
        }
    }

    pub fn attach(&self, stream: TcpStream) {
        *self.stream() = Some(stream);
    }

    pub fn detach(&self) {
        if let Some(stream) = self.stream().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn stream(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSink for LineConnection {
    fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        let line = frame
            .encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut guard = self.stream();
        let Some(stream) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "control connection is down",
            ));
        };
        let result = stream.write_all(line.as_bytes()).and_then(|()| stream.flush());
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

/// Feeds every decodable frame read from `reader` to `on_frame` until EOF,
/// a read error, or `stop` is raised.
pub fn read_frames<R: Read>(reader: R, stop: &AtomicBool, mut on_frame: impl FnMut(Frame)) {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        line.clear();
        let bytes = match reader.read_line(&mut line) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!(error = %err, "connection read failed");
                break;
            }
        };
        if bytes == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        match Frame::decode(&line) {
            Ok(frame) => on_frame(frame),
            Err(err) => tracing::warn!(error = %err, "dropping undecodable frame"),
        }
    }
}

use std::env;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {code:?}: {stderr}")]
    Status {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

pub(crate) fn command_exists(cmd: &str) -> bool {
    if cmd.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(cmd).is_file();
    }
    if let Ok(path) = env::var("PATH") {
        for entry in env::split_paths(&path) {
            let candidate = entry.join(cmd);
            if candidate.is_file() {
                return true;
            }
        }
    }
    false
}

pub(crate) fn run_status(cmd: &[&str]) -> bool {
    run_output(cmd)
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub(crate) fn run_output(cmd: &[&str]) -> Result<Output, CommandError> {
    let (program, args) = cmd.split_first().ok_or(CommandError::Empty)?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.output().map_err(|source| CommandError::Spawn {
        program: (*program).to_string(),
        source,
    })
}

/// Runs `cmd` and returns stdout, failing on a non-zero exit.
pub(crate) fn run_checked(cmd: &[&str]) -> Result<String, CommandError> {
    let output = run_output(cmd)?;
    if !output.status.success() {
        return Err(CommandError::Status {
            program: cmd.join(" "),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn spawn_process_group(cmd: &mut Command) -> io::Result<Child> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    cmd.spawn()
}

/// Asks the process group led by `pid` to shut down.
pub(crate) fn terminate_group(pid: u32) -> bool {
    signal_group(pid, Signal::Terminate)
}

pub(crate) fn kill_group(pid: u32) -> bool {
    signal_group(pid, Signal::Kill)
}

#[derive(Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

fn signal_group(pid: u32, signal: Signal) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        unsafe { libc::killpg(pid, signo) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = signal;
        false
    }
}

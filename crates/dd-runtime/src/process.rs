use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dd_types::{ExecutionFailure, ExecutionFailureKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Exit code reported for a process killed because it ran out of time.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed while waiting for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

impl From<ProcessError> for ExecutionFailure {
    fn from(err: ProcessError) -> Self {
        ExecutionFailure::new(ExecutionFailureKind::Spawn, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandOutput {
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Renders a command as a single shell-like line for logs and reports.
#[must_use]
pub fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs `command` to completion, capturing both streams. With a timeout the
/// child is killed once it is exceeded and the output reports
/// [`TIMEOUT_EXIT_CODE`].
pub fn run_with_timeout(
    command: &mut Command,
    timeout: Option<Duration>,
) -> Result<CommandOutput, ProcessError> {
    let rendered = describe(command);
    debug!(command = %rendered, ?timeout, "spawning process");

    let start = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: rendered.clone(),
            source,
        })?;
    let stdout_handle = child
        .stdout
        .take()
        .map(|mut stdout| thread::spawn(move || read_lossy(&mut stdout)));
    let stderr_handle = child
        .stderr
        .take()
        .map(|mut stderr| thread::spawn(move || read_lossy(&mut stderr)));

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(source) => {
                let _ = child.kill();
                return Err(ProcessError::Wait {
                    command: rendered,
                    source,
                });
            }
        }
        if timeout.is_some_and(|limit| start.elapsed() >= limit) {
            timed_out = true;
            let _ = child.kill();
            break child.wait().ok();
        }
        thread::sleep(POLL_INTERVAL);
    };

    let duration = start.elapsed();
    let stdout = join_output(stdout_handle);
    let mut stderr = join_output(stderr_handle);
    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("process timed out after {duration:?}"));
    }

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        status.and_then(|status| status.code()).unwrap_or(-1)
    };
    debug!(command = %rendered, exit_code, timed_out, "process finished");

    Ok(CommandOutput {
        command: rendered,
        exit_code,
        stdout,
        stderr,
        duration_ms: duration.as_millis() as u64,
        timed_out,
    })
}

fn read_lossy(reader: &mut impl Read) -> String {
    let mut buffer = Vec::new();
    let _ = reader.read_to_end(&mut buffer);
    String::from_utf8_lossy(&buffer).into_owned()
}

fn join_output(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

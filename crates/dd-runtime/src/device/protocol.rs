use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use dd_types::{ConfigurationError, ExecutionResult};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::device::config::DeviceConfig;
use crate::device::error::{DeviceError, TransportError};
use crate::device::locks::DeviceLocks;
use crate::device::session::{CancelToken, DeviceSession, SessionState, new_correlation_id};
use crate::device::transport::DeviceTransport;
use crate::executor::RunError;
use crate::vm::{VmInvocation, target_join};

const EXIT_STATUS_FILE: &str = "exitStatus";

/// Runs the command given after the session id and records its exit status
/// next to itself, because the shell bridge does not report it reliably.
const SESSION_SCRIPT: &str = "#!/system/bin/sh\n\
# usage: <script> <session-id> <command...>\n\
shift\n\
\"$@\"\n\
echo $? > \"${0%/*}/exitStatus\"\n";

#[cfg(windows)]
const HOST_LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
const HOST_LINE_SEPARATOR: &str = "\n";

/// Outcome of one device run together with the session record.
#[derive(Debug)]
pub struct SessionReport {
    pub session: DeviceSession,
    pub result: Result<ExecutionResult, RunError>,
}

struct StagedFiles {
    script: String,
    classpath: Vec<String>,
    boot_classpath: Vec<String>,
}

/// Runs a [`VmInvocation`] on the single attached device: push, execute,
/// pull the exit status, and always clean up.
#[derive(Clone)]
pub struct DeviceProtocol {
    transport: Arc<dyn DeviceTransport>,
    config: DeviceConfig,
    locks: Arc<DeviceLocks>,
    cancel: CancelToken,
}

impl std::fmt::Debug for DeviceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProtocol")
            .field("transport", &self.transport.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeviceProtocol {
    #[must_use]
    pub fn new(transport: Arc<dyn DeviceTransport>, config: DeviceConfig) -> Self {
        Self {
            transport,
            config,
            locks: Arc::new(DeviceLocks::new()),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_locks(mut self, locks: Arc<DeviceLocks>) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&self, invocation: &VmInvocation) -> Result<ExecutionResult, RunError> {
        self.run_session(invocation).result
    }

    pub fn run_session(&self, invocation: &VmInvocation) -> SessionReport {
        let mut session = DeviceSession::new(new_correlation_id());
        let correlation_id = session.correlation_id().to_owned();
        let result = self.drive(&mut session, invocation).map_err(|err| {
            warn!(correlation_id = %correlation_id, error = %err, "device session failed");
            err.into_run_error(&correlation_id)
        });
        if result.is_err() {
            session.fail();
        }
        SessionReport { session, result }
    }

    fn drive(
        &self,
        session: &mut DeviceSession,
        invocation: &VmInvocation,
    ) -> Result<ExecutionResult, DeviceError> {
        self.checkpoint(SessionState::BridgeReady)?;
        self.await_bridge()?;
        session.advance(SessionState::BridgeReady);

        let serial = self.select_device()?;
        session.attach_device(&serial);
        let device_lock = self
            .locks
            .handle(&serial)
            .map_err(|err| DeviceError::transport("cannot reserve device", err))?;
        let _held = device_lock.lock().map_err(|_| {
            DeviceError::transport(
                "cannot reserve device",
                TransportError::Command(format!("lock for {serial} poisoned")),
            )
        })?;

        let cleanup = CleanupGuard::arm(
            self.transport.as_ref(),
            &serial,
            self.config.cleanup_command(session.correlation_id()),
        );
        let outcome = self.run_on_device(session, &serial, invocation);
        if outcome.is_err() {
            session.fail();
        }
        match cleanup.finish() {
            Ok(()) => session.advance(SessionState::Cleaned),
            Err(err) => {
                warn!(
                    correlation_id = %session.correlation_id(),
                    error = %err,
                    "error while deleting test files on device"
                );
                if outcome.is_ok() {
                    return Err(DeviceError::transport(
                        "error while deleting test files on device",
                        err,
                    ));
                }
            }
        }
        outcome
    }

    fn run_on_device(
        &self,
        session: &mut DeviceSession,
        serial: &str,
        invocation: &VmInvocation,
    ) -> Result<ExecutionResult, DeviceError> {
        let correlation_id = session.correlation_id().to_owned();

        self.checkpoint(SessionState::RootEscalated)?;
        self.check_runtime(serial)?;
        self.ensure_root(serial)?;
        session.advance(SessionState::RootEscalated);

        self.checkpoint(SessionState::FilesPushed)?;
        let scratch = self.config.scratch_dir(&correlation_id);
        let staged = self.install_files(serial, &scratch, invocation)?;
        session.advance(SessionState::FilesPushed);

        self.checkpoint(SessionState::CommandExecuted)?;
        let mut command_line = vec![staged.script.clone(), correlation_id.clone()];
        command_line.push(self.config.vm_binary());
        command_line.extend(invocation.arguments_with(&staged.classpath, &staged.boot_classpath));
        let command = command_line.join(" ");
        // The shell's own status is unreliable; the script's file is the truth.
        let stdout = self
            .transport
            .shell(serial, &command, self.config.execute_timeout())
            .map_err(|err| {
                DeviceError::transport(format!("failed to execute shell command: '{command}'"), err)
            })?;
        session.advance(SessionState::CommandExecuted);

        self.checkpoint(SessionState::ResultPulled)?;
        let exit_code = self.pull_exit_status(serial, &scratch)?;
        session.advance(SessionState::ResultPulled);
        if exit_code == 0 {
            debug!(correlation_id = %correlation_id, serial, "device run finished");
        } else {
            info!(
                correlation_id = %correlation_id,
                serial,
                exit_code,
                "execution failed on device"
            );
        }

        Ok(ExecutionResult {
            exit_code,
            stdout: to_host_line_endings(&stdout),
            stderr: String::new(),
            command,
            correlation_id: Some(correlation_id),
        })
    }

    fn checkpoint(&self, next: SessionState) -> Result<(), DeviceError> {
        if self.cancel.is_cancelled() {
            Err(DeviceError::Cancelled { step: next })
        } else {
            Ok(())
        }
    }

    fn await_bridge(&self) -> Result<(), DeviceError> {
        self.transport.connect().map_err(|err| match err {
            TransportError::NotFound(detail) => ConfigurationError::TransportNotFound { detail },
            other => ConfigurationError::TransportMisconfigured {
                detail: other.to_string(),
            },
        })?;

        let budget = self.config.ready_budget();
        let step = self.config.ready_step();
        let start = Instant::now();
        loop {
            if self.transport.is_ready() {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= budget {
                break;
            }
            self.checkpoint(SessionState::BridgeReady)?;
            thread::sleep(step.min(budget - elapsed));
        }
        Err(ConfigurationError::TransportMisconfigured {
            detail: format!(
                "{} bridge not ready after {} ms",
                self.transport.name(),
                budget.as_millis()
            ),
        }
        .into())
    }

    fn select_device(&self) -> Result<String, DeviceError> {
        let devices = self.transport.list_devices().map_err(|err| {
            ConfigurationError::TransportMisconfigured {
                detail: format!("cannot list devices: {err}"),
            }
        })?;
        if devices.len() > 1 {
            return Err(ConfigurationError::MultipleDevices { devices }.into());
        }
        devices
            .into_iter()
            .next()
            .ok_or_else(|| ConfigurationError::NoDevice.into())
    }

    fn check_runtime(&self, serial: &str) -> Result<(), DeviceError> {
        let command = format!("{} -showversion", self.config.vm_binary());
        let banner = self
            .transport
            .shell(serial, &command, None)
            .map_err(|err| DeviceError::transport("could not check device runtime", err))?;
        if banner.contains(&self.config.runtime_family) {
            Ok(())
        } else {
            Err(ConfigurationError::WrongRuntimeFamily {
                expected: self.config.runtime_family.clone(),
                reported: banner.trim().to_owned(),
            }
            .into())
        }
    }

    fn ensure_root(&self, serial: &str) -> Result<(), DeviceError> {
        let mut is_root = self.transport.is_root(serial).map_err(|err| {
            DeviceError::transport(format!("cannot fetch root status for device '{serial}'"), err)
        })?;

        let mut attempts = 0;
        while !is_root && attempts < self.config.root_attempts {
            attempts += 1;
            match self.transport.root(serial) {
                Ok(now_root) => is_root = now_root,
                // The daemon restart often drops the connection mid-request.
                Err(err) => debug!(serial, attempt = attempts, error = %err, "root request failed"),
            }
            if !is_root {
                warn!(serial, attempt = attempts, "device not root yet");
            }
            thread::sleep(self.config.root_backoff());
        }

        if is_root {
            Ok(())
        } else {
            Err(ConfigurationError::RootUnavailable {
                device: serial.to_owned(),
                detail: format!("still unprivileged after {attempts} attempts"),
            }
            .into())
        }
    }

    fn install_files(
        &self,
        serial: &str,
        scratch: &str,
        invocation: &VmInvocation,
    ) -> Result<StagedFiles, DeviceError> {
        self.shell(serial, &format!("mkdir {scratch}"))?;
        self.shell(serial, &format!("rm {}", target_join(scratch, "*")))?;

        let script = target_join(scratch, &self.config.script_name);
        let local_script = write_session_script()?;
        self.push(serial, local_script.path(), &script)?;
        self.shell(serial, &format!("chmod 777 {script}"))?;

        let mut index = 0;
        let boot_classpath =
            self.push_all(serial, scratch, invocation.boot_classpath(), &mut index)?;
        let classpath = self.push_all(serial, scratch, invocation.classpath(), &mut index)?;
        Ok(StagedFiles {
            script,
            classpath,
            boot_classpath,
        })
    }

    fn push_all(
        &self,
        serial: &str,
        scratch: &str,
        files: &[PathBuf],
        index: &mut usize,
    ) -> Result<Vec<String>, DeviceError> {
        let mut remote_paths = Vec::with_capacity(files.len());
        for file in files {
            let name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_owned());
            let remote = target_join(scratch, &format!("f{index}_{name}"));
            self.push(serial, file, &remote)?;
            remote_paths.push(remote);
            *index += 1;
        }
        Ok(remote_paths)
    }

    fn pull_exit_status(&self, serial: &str, scratch: &str) -> Result<i32, DeviceError> {
        let remote = target_join(scratch, EXIT_STATUS_FILE);
        let local = tempfile::Builder::new()
            .prefix("dd-exit-status")
            .tempfile()?;
        self.transport
            .pull(serial, &remote, local.path())
            .map_err(|err| DeviceError::MissingExitStatus {
                path: remote.clone(),
                detail: err.to_string(),
            })?;
        let content = fs::read_to_string(local.path())?;
        parse_exit_status(&remote, &content)
    }

    fn shell(&self, serial: &str, command: &str) -> Result<String, DeviceError> {
        self.transport.shell(serial, command, None).map_err(|err| {
            DeviceError::transport(format!("failed to execute shell command: '{command}'"), err)
        })
    }

    fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), DeviceError> {
        self.transport.push(serial, local, remote).map_err(|err| {
            DeviceError::transport(
                format!(
                    "unable to push file '{}' on device into '{remote}'",
                    local.display()
                ),
                err,
            )
        })
    }
}

/// Issues the cleanup command exactly once: explicitly through
/// [`CleanupGuard::finish`] or, on an early return or panic, from `Drop`.
struct CleanupGuard<'a> {
    transport: &'a dyn DeviceTransport,
    serial: &'a str,
    command: String,
    armed: bool,
}

impl<'a> CleanupGuard<'a> {
    fn arm(transport: &'a dyn DeviceTransport, serial: &'a str, command: String) -> Self {
        Self {
            transport,
            serial,
            command,
            armed: true,
        }
    }

    fn finish(mut self) -> Result<(), TransportError> {
        self.armed = false;
        self.transport
            .shell(self.serial, &self.command, None)
            .map(|_| ())
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(err) = self.transport.shell(self.serial, &self.command, None) {
            warn!(serial = self.serial, error = %err, "cleanup after aborted session failed");
        }
    }
}

fn write_session_script() -> Result<NamedTempFile, DeviceError> {
    let mut file = tempfile::Builder::new()
        .prefix("dd-session")
        .suffix(".sh")
        .tempfile()?;
    file.write_all(SESSION_SCRIPT.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn parse_exit_status(path: &str, content: &str) -> Result<i32, DeviceError> {
    let Some(line) = content.lines().next() else {
        return Err(DeviceError::MissingExitStatus {
            path: path.to_owned(),
            detail: "file is empty".to_owned(),
        });
    };
    line.trim()
        .parse::<i32>()
        .map_err(|_| DeviceError::UnparsableExitStatus {
            content: line.to_owned(),
        })
}

/// Normalizes device output (`\r\n` or `\n`) to the host line separator.
#[must_use]
pub fn to_host_line_endings(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    if HOST_LINE_SEPARATOR == "\n" {
        normalized
    } else {
        normalized.replace('\n', HOST_LINE_SEPARATOR)
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceError, parse_exit_status, to_host_line_endings};

    #[test]
    fn exit_status_uses_first_line() {
        assert_eq!(parse_exit_status("/d/exitStatus", "1\n").expect("parses"), 1);
        assert_eq!(parse_exit_status("/d/exitStatus", " 0 \nnoise\n").expect("parses"), 0);
    }

    #[test]
    fn empty_or_garbled_exit_status_is_rejected() {
        assert!(matches!(
            parse_exit_status("/d/exitStatus", ""),
            Err(DeviceError::MissingExitStatus { .. })
        ));
        assert!(matches!(
            parse_exit_status("/d/exitStatus", "sh: not found\n"),
            Err(DeviceError::UnparsableExitStatus { .. })
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn device_line_endings_become_host_line_endings() {
        assert_eq!(to_host_line_endings("a\r\nb\nc"), "a\nb\nc");
    }
}

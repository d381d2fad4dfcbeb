use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::device::error::TransportError;
use crate::device::transport::DeviceTransport;
use crate::process::{CommandOutput, ProcessError, run_with_timeout};

pub const SDK_HOME_ENV: &str = "ANDROID_SDK_HOME";

const BRIDGE_TIMEOUT: Duration = Duration::from_secs(30);

/// [`DeviceTransport`] backed by the `adb` command line tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbTransport {
    adb: PathBuf,
    sdk_home: Option<PathBuf>,
}

impl AdbTransport {
    #[must_use]
    pub fn new(adb: impl Into<PathBuf>) -> Self {
        Self {
            adb: adb.into(),
            sdk_home: None,
        }
    }

    /// `$ANDROID_SDK_HOME/platform-tools/adb` when the variable is set,
    /// otherwise `adb` from `PATH`.
    #[must_use]
    pub fn locate() -> Self {
        Self::from_sdk_home(std::env::var_os(SDK_HOME_ENV).map(PathBuf::from))
    }

    #[must_use]
    pub fn from_sdk_home(sdk_home: Option<PathBuf>) -> Self {
        match sdk_home {
            Some(home) => Self {
                adb: home.join("platform-tools").join("adb"),
                sdk_home: Some(home),
            },
            None => Self::new("adb"),
        }
    }

    #[must_use]
    pub fn adb_path(&self) -> &Path {
        &self.adb
    }

    fn not_found_hint(&self) -> String {
        match &self.sdk_home {
            Some(home) => format!("adb not found; check SDK location '{}'", home.display()),
            None => format!("adb not found; set either PATH or {SDK_HOME_ENV}"),
        }
    }

    fn adb(
        &self,
        serial: Option<&str>,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, TransportError> {
        let mut command = Command::new(&self.adb);
        if let Some(serial) = serial {
            command.args(["-s", serial]);
        }
        command.args(args);
        let output = run_with_timeout(&mut command, timeout).map_err(|err| {
            if err.is_not_found() {
                TransportError::NotFound(self.not_found_hint())
            } else {
                match err {
                    ProcessError::Spawn { source, .. } | ProcessError::Wait { source, .. } => {
                        TransportError::Io(source)
                    }
                }
            }
        })?;
        if output.timed_out {
            return Err(TransportError::TimedOut(output.command));
        }
        Ok(output)
    }

    fn adb_checked(
        &self,
        serial: Option<&str>,
        args: &[&str],
        context: impl FnOnce() -> String,
    ) -> Result<CommandOutput, TransportError> {
        let output = self.adb(serial, args, Some(BRIDGE_TIMEOUT))?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(TransportError::Command(format!(
                "{}: exit {}: {}",
                context(),
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

impl Default for AdbTransport {
    fn default() -> Self {
        Self::locate()
    }
}

/// Serials of devices in the `device` state from `adb devices` output.
#[must_use]
pub fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            (fields.next() == Some("device")).then(|| serial.to_owned())
        })
        .collect()
}

/// First line of `stderr` written by adb itself rather than by the remote
/// command.
fn bridge_diagnostic(stderr: &str) -> Option<&str> {
    stderr.lines().map(str::trim).find(|line| {
        line.starts_with("error:")
            || line.starts_with("adb: error:")
            || line.contains("no devices/emulators found")
    })
}

impl DeviceTransport for AdbTransport {
    fn connect(&self) -> Result<(), TransportError> {
        self.adb_checked(None, &["start-server"], || "cannot start adb server".to_owned())
            .map(|_| ())
    }

    fn is_ready(&self) -> bool {
        self.adb(None, &["devices"], Some(BRIDGE_TIMEOUT))
            .is_ok_and(|output| output.is_success())
    }

    fn list_devices(&self) -> Result<Vec<String>, TransportError> {
        let output = self.adb_checked(None, &["devices"], || "cannot list devices".to_owned())?;
        Ok(parse_device_list(&output.stdout))
    }

    fn is_root(&self, serial: &str) -> Result<bool, TransportError> {
        let output = self.adb_checked(Some(serial), &["shell", "id", "-u"], || {
            format!("cannot query user id on {serial}")
        })?;
        Ok(output.stdout.trim() == "0")
    }

    fn root(&self, serial: &str) -> Result<bool, TransportError> {
        self.adb_checked(Some(serial), &["root"], || format!("adb root failed on {serial}"))?;
        self.adb_checked(Some(serial), &["wait-for-device"], || {
            format!("{serial} did not come back after adb root")
        })?;
        self.is_root(serial)
    }

    fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), TransportError> {
        let local_text = local.to_string_lossy();
        debug!(serial, local = %local_text, remote, "adb push");
        self.adb_checked(Some(serial), &["push", local_text.as_ref(), remote], || {
            format!("unable to push '{local_text}' into '{remote}'")
        })
        .map(|_| ())
    }

    fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<(), TransportError> {
        let local_text = local.to_string_lossy();
        debug!(serial, remote, local = %local_text, "adb pull");
        self.adb_checked(Some(serial), &["pull", remote, local_text.as_ref()], || {
            format!("unable to pull '{remote}' into '{local_text}'")
        })
        .map(|_| ())
    }

    fn shell(
        &self,
        serial: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, TransportError> {
        debug!(serial, command, "adb shell");
        let output = self.adb(Some(serial), &["shell", command], timeout)?;
        // The remote exit code is ignored; only adb's own failures count.
        match bridge_diagnostic(&output.stderr) {
            Some(diagnostic) => Err(TransportError::Command(format!(
                "shell '{command}' on {serial}: {diagnostic}"
            ))),
            None => Ok(output.stdout),
        }
    }

    fn name(&self) -> &'static str {
        "adb"
    }
}

use std::path::Path;
use std::time::Duration;

use crate::device::error::TransportError;

/// Bridge to attached devices. Every call names the device serial so one
/// transport can serve several sessions.
pub trait DeviceTransport: Send + Sync {
    /// Starts or attaches to the bridge. A missing bridge executable is
    /// reported as [`TransportError::NotFound`].
    fn connect(&self) -> Result<(), TransportError>;

    fn is_ready(&self) -> bool;

    fn list_devices(&self) -> Result<Vec<String>, TransportError>;

    fn is_root(&self, serial: &str) -> Result<bool, TransportError>;

    /// Asks the device daemon to restart as root and reports whether it is
    /// root afterwards.
    fn root(&self, serial: &str) -> Result<bool, TransportError>;

    fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), TransportError>;

    fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<(), TransportError>;

    /// Runs a shell command and returns its output. The shell's own exit
    /// status is not reported.
    fn shell(
        &self,
        serial: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, TransportError>;

    fn name(&self) -> &'static str {
        "device-transport"
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Total time the bridge gets to report ready after `connect`.
    pub bridge_ready_ms: u64,
    pub bridge_ready_steps: u32,
    pub root_attempts: u32,
    pub root_backoff_ms: u64,
    /// Mount point that holds the per-session scratch directory.
    pub data_mount: String,
    /// Root of the on-device runtime (`<runtime_root>/bin/dalvikvm`).
    pub runtime_root: String,
    /// Runtime family the device must report from `dalvikvm -showversion`.
    pub runtime_family: String,
    pub scratch_prefix: String,
    pub script_name: String,
    pub execute_timeout_ms: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bridge_ready_ms: 5_000,
            bridge_ready_steps: 10,
            root_attempts: 5,
            root_backoff_ms: 1_000,
            data_mount: "/data".to_owned(),
            runtime_root: "/system".to_owned(),
            runtime_family: "ART".to_owned(),
            scratch_prefix: "dd-tests".to_owned(),
            script_name: "run-with-exit-status.sh".to_owned(),
            execute_timeout_ms: Some(60_000),
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn with_bridge_ready(mut self, budget_ms: u64, steps: u32) -> Self {
        self.bridge_ready_ms = budget_ms;
        self.bridge_ready_steps = steps.max(1);
        self
    }

    #[must_use]
    pub fn with_root_retries(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.root_attempts = attempts;
        self.root_backoff_ms = backoff_ms;
        self
    }

    #[must_use]
    pub fn with_data_mount(mut self, data_mount: impl Into<String>) -> Self {
        self.data_mount = data_mount.into();
        self
    }

    #[must_use]
    pub fn with_runtime_root(mut self, runtime_root: impl Into<String>) -> Self {
        self.runtime_root = runtime_root.into();
        self
    }

    #[must_use]
    pub fn with_execute_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.execute_timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn ready_budget(&self) -> Duration {
        Duration::from_millis(self.bridge_ready_ms)
    }

    #[must_use]
    pub fn ready_step(&self) -> Duration {
        Duration::from_millis(self.bridge_ready_ms / u64::from(self.bridge_ready_steps.max(1)))
    }

    #[must_use]
    pub fn root_backoff(&self) -> Duration {
        Duration::from_millis(self.root_backoff_ms)
    }

    #[must_use]
    pub fn execute_timeout(&self) -> Option<Duration> {
        self.execute_timeout_ms.map(Duration::from_millis)
    }

    /// Scratch directory on the device for one session.
    #[must_use]
    pub fn scratch_dir(&self, correlation_id: &str) -> String {
        format!(
            "{}/{}-{correlation_id}",
            self.data_mount.trim_end_matches('/'),
            self.scratch_prefix
        )
    }

    /// Removes everything a session left behind under the data mount.
    #[must_use]
    pub fn cleanup_command(&self, correlation_id: &str) -> String {
        format!(
            "find {} -name '*{}-{correlation_id}*' -exec rm -rf {{}} +",
            self.data_mount, self.scratch_prefix
        )
    }

    #[must_use]
    pub fn vm_binary(&self) -> String {
        format!("{}/bin/dalvikvm", self.runtime_root.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::DeviceConfig;

    #[test]
    fn defaults_split_ready_budget_into_ten_steps() {
        let config = DeviceConfig::default();
        assert_eq!(config.ready_budget(), Duration::from_millis(5_000));
        assert_eq!(config.ready_step(), Duration::from_millis(500));
        assert_eq!(config.root_attempts, 5);
        assert_eq!(config.root_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn scratch_and_cleanup_share_the_session_marker() {
        let config = DeviceConfig::default();
        assert_eq!(config.scratch_dir("abc"), "/data/dd-tests-abc");
        assert_eq!(
            config.cleanup_command("abc"),
            "find /data -name '*dd-tests-abc*' -exec rm -rf {} +"
        );
        assert_eq!(config.vm_binary(), "/system/bin/dalvikvm");
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::device::error::TransportError;
use crate::device::transport::DeviceTransport;

/// Transport operations that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FakeStep {
    Connect,
    ListDevices,
    IsRoot,
    Root,
    Push,
    Pull,
    Shell,
    Execute,
    Cleanup,
}

#[derive(Debug)]
struct FakeState {
    bridge_missing: bool,
    ready_after_polls: Option<u32>,
    polls: u32,
    devices: Vec<String>,
    root: bool,
    root_after_attempts: Option<u32>,
    root_attempts: u32,
    runtime_banner: String,
    program_stdout: String,
    exit_status_file: Option<String>,
    files: BTreeMap<String, Vec<u8>>,
    failures: BTreeSet<FakeStep>,
    log: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            bridge_missing: false,
            ready_after_polls: Some(0),
            polls: 0,
            devices: vec!["emulator-5554".to_owned()],
            root: true,
            root_after_attempts: None,
            root_attempts: 0,
            runtime_banner: "ART version 2.1.0 x86_64".to_owned(),
            program_stdout: String::new(),
            exit_status_file: Some("0\n".to_owned()),
            files: BTreeMap::new(),
            failures: BTreeSet::new(),
            log: Vec::new(),
        }
    }
}

/// In-memory device. Files pushed to it are kept in a map, the session
/// script is interpreted instead of executed, and every call is logged so
/// tests can count what the protocol did.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn without_bridge(self) -> Self {
        self.state().bridge_missing = true;
        self
    }

    /// `None` keeps the bridge from ever reporting ready.
    #[must_use]
    pub fn ready_after_polls(self, polls: Option<u32>) -> Self {
        self.state().ready_after_polls = polls;
        self
    }

    #[must_use]
    pub fn with_devices<I, S>(self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().devices = devices.into_iter().map(Into::into).collect();
        self
    }

    /// Device starts unprivileged; `Some(n)` grants root on the n-th
    /// escalation request.
    #[must_use]
    pub fn root_after_attempts(self, attempts: Option<u32>) -> Self {
        {
            let mut state = self.state();
            state.root = false;
            state.root_after_attempts = attempts;
        }
        self
    }

    #[must_use]
    pub fn with_runtime_banner(self, banner: impl Into<String>) -> Self {
        self.state().runtime_banner = banner.into();
        self
    }

    /// Output printed by the program and the content the session script
    /// leaves in the exit status file (`None` leaves no file).
    #[must_use]
    pub fn with_program(self, stdout: impl Into<String>, exit_status_file: Option<&str>) -> Self {
        {
            let mut state = self.state();
            state.program_stdout = stdout.into();
            state.exit_status_file = exit_status_file.map(str::to_owned);
        }
        self
    }

    #[must_use]
    pub fn failing_at(self, step: FakeStep) -> Self {
        self.state().failures.insert(step);
        self
    }

    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state().log.clone()
    }

    #[must_use]
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }

    #[must_use]
    pub fn root_requests(&self) -> u32 {
        self.state().root_attempts
    }

    #[must_use]
    pub fn remote_files(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    fn check(state: &FakeState, step: FakeStep, context: &str) -> Result<(), TransportError> {
        if state.failures.contains(&step) {
            Err(TransportError::Command(format!("injected {step:?} failure: {context}")))
        } else {
            Ok(())
        }
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

impl DeviceTransport for FakeTransport {
    fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.log.push("connect".to_owned());
        if state.bridge_missing {
            return Err(TransportError::NotFound("fake bridge is not installed".to_owned()));
        }
        Self::check(&state, FakeStep::Connect, "connect")
    }

    fn is_ready(&self) -> bool {
        let mut state = self.state();
        state.polls += 1;
        let polls = state.polls;
        state.ready_after_polls.is_some_and(|needed| polls > needed)
    }

    fn list_devices(&self) -> Result<Vec<String>, TransportError> {
        let mut state = self.state();
        state.log.push("devices".to_owned());
        Self::check(&state, FakeStep::ListDevices, "devices")?;
        Ok(state.devices.clone())
    }

    fn is_root(&self, serial: &str) -> Result<bool, TransportError> {
        let mut state = self.state();
        state.log.push(format!("is-root {serial}"));
        Self::check(&state, FakeStep::IsRoot, serial)?;
        Ok(state.root)
    }

    fn root(&self, serial: &str) -> Result<bool, TransportError> {
        let mut state = self.state();
        state.log.push(format!("root {serial}"));
        state.root_attempts += 1;
        Self::check(&state, FakeStep::Root, serial)?;
        if state
            .root_after_attempts
            .is_some_and(|needed| state.root_attempts >= needed)
        {
            state.root = true;
        }
        Ok(state.root)
    }

    fn push(&self, _serial: &str, local: &Path, remote: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        state.log.push(format!("push {remote}"));
        Self::check(&state, FakeStep::Push, remote)?;
        let bytes = std::fs::read(local)?;
        state.files.insert(remote.to_owned(), bytes);
        Ok(())
    }

    fn pull(&self, _serial: &str, remote: &str, local: &Path) -> Result<(), TransportError> {
        let mut state = self.state();
        state.log.push(format!("pull {remote}"));
        Self::check(&state, FakeStep::Pull, remote)?;
        let bytes = state
            .files
            .get(remote)
            .ok_or_else(|| {
                TransportError::Command(format!("remote object '{remote}' does not exist"))
            })?;
        std::fs::write(local, bytes)?;
        Ok(())
    }

    fn shell(
        &self,
        _serial: &str,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<String, TransportError> {
        let mut state = self.state();
        state.log.push(format!("shell {command}"));
        Self::check(&state, FakeStep::Shell, command)?;

        if command.starts_with("find ") {
            Self::check(&state, FakeStep::Cleanup, command)?;
            let marker = command
                .split('\'')
                .nth(1)
                .unwrap_or_default()
                .trim_matches('*')
                .to_owned();
            state.files.retain(|path, _| marker.is_empty() || !path.contains(&marker));
            return Ok(String::new());
        }
        if command.ends_with("-showversion") {
            return Ok(state.runtime_banner.clone());
        }

        let program = command.split_whitespace().next().unwrap_or_default();
        if program.ends_with(".sh") && state.files.contains_key(program) {
            Self::check(&state, FakeStep::Execute, command)?;
            if let Some(content) = state.exit_status_file.clone() {
                let exit_file = format!("{}/exitStatus", parent_dir(program));
                state.files.insert(exit_file, content.into_bytes());
            }
            return Ok(state.program_stdout.clone());
        }
        Ok(String::new())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

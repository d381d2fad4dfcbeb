use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    BridgeReady,
    RootEscalated,
    FilesPushed,
    CommandExecuted,
    ResultPulled,
    Cleaned,
    Failed,
}

/// Record of one device run: its id, the device it used and every state it
/// went through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSession {
    correlation_id: String,
    device: Option<String>,
    trail: Vec<SessionState>,
}

impl DeviceSession {
    #[must_use]
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            device: None,
            trail: vec![SessionState::Init],
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    #[must_use]
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    #[must_use]
    pub fn trail(&self) -> &[SessionState] {
        &self.trail
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.trail.last().copied().unwrap_or(SessionState::Init)
    }

    pub(crate) fn attach_device(&mut self, serial: &str) {
        self.device = Some(serial.to_owned());
    }

    pub(crate) fn advance(&mut self, next: SessionState) {
        debug!(
            correlation_id = %self.correlation_id,
            from = ?self.state(),
            to = ?next,
            "device session transition"
        );
        self.trail.push(next);
    }

    pub(crate) fn fail(&mut self) {
        if !self.trail.contains(&SessionState::Failed) {
            self.advance(SessionState::Failed);
        }
    }
}

/// Cooperative cancellation shared between a caller and running sessions.
/// Checked between protocol steps; cleanup still runs after it fires.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fresh id used to name the scratch directory and to tag logs and
/// failures of one session.
#[must_use]
pub fn new_correlation_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let count = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let seed = format!("{}:{nanos}:{count}", std::process::id());
    let mut id = format!("{:x}", Sha256::digest(seed.as_bytes()));
    id.truncate(32);
    id
}

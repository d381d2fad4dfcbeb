use dd_types::{ConfigurationError, ExecutionFailure, ExecutionFailureKind};
use thiserror::Error;

use crate::device::SessionState;
use crate::executor::RunError;

/// Failure reported by a [`DeviceTransport`](crate::device::DeviceTransport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device bridge not available: {0}")]
    NotFound(String),
    #[error("{0}")]
    Command(String),
    #[error("transport timed out: {0}")]
    TimedOut(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: TransportError,
    },
    #[error("exit status not found at {path}: {detail}")]
    MissingExitStatus { path: String, detail: String },
    #[error("cannot parse exit status {content:?}")]
    UnparsableExitStatus { content: String },
    #[error("session cancelled before {step:?}")]
    Cancelled { step: SessionState },
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    pub(crate) fn transport(context: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    /// Splits the failure into the two outcomes a run can have. Environment
    /// problems stay configuration errors; everything else is an execution
    /// failure tagged with the session id.
    #[must_use]
    pub fn into_run_error(self, correlation_id: &str) -> RunError {
        let kind = match self {
            Self::Configuration(err) => return RunError::Configuration(err),
            Self::Transport {
                source: TransportError::TimedOut(_),
                ..
            } => ExecutionFailureKind::TimedOut,
            Self::Transport { .. } => ExecutionFailureKind::Transport,
            Self::MissingExitStatus { .. } => ExecutionFailureKind::MissingExitStatus,
            Self::UnparsableExitStatus { .. } => ExecutionFailureKind::UnparsableExitStatus,
            Self::Cancelled { .. } => ExecutionFailureKind::Cancelled,
            Self::Io(_) => ExecutionFailureKind::Transport,
        };
        RunError::Execution(
            ExecutionFailure::new(kind, self.to_string()).with_correlation_id(correlation_id),
        )
    }
}

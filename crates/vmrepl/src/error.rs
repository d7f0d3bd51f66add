//! Supervisor error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors reported to callers of the supervisor.
///
/// None of these leave a session outside its state machine: every failing
/// operation resolves the session to `Ready`, `Booting` (boot timeout only)
/// or `Stopped` before the error is returned.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The instance key is not in the allowed set.
    #[error("invalid instance '{key}'. Valid: {valid}")]
    InvalidKey { key: String, valid: String },

    /// The child is alive but never printed its ready-prompt.
    #[error("[{key}] timeout waiting for prompt after {}s", timeout.as_secs_f64())]
    BootTimeout { key: String, timeout: Duration },

    /// The child exited before (or while) producing a ready-prompt.
    #[error("[{key}] process died while waiting for prompt: {detail}")]
    ProcessDied { key: String, detail: String },

    /// Input was sent but no prompt followed within the evaluation window.
    /// The instance has been stopped; the next request boots a fresh one.
    #[error(
        "[{key}] timeout waiting for response after {}s; instance was stopped and will boot again on next use",
        timeout.as_secs_f64()
    )]
    EvalTimeout { key: String, timeout: Duration },

    /// The launch command could not be started.
    #[error("[{key}] failed to launch instance: {source}")]
    Spawn {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Terminal channel I/O failed; the instance was torn down.
    #[error("[{key}] terminal i/o error: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// The registry has been shut down and accepts no new work.
    #[error("supervisor is shut down")]
    ShutDown,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SupervisorError {
    /// Whether the caller can reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BootTimeout { .. }
                | Self::ProcessDied { .. }
                | Self::EvalTimeout { .. }
                | Self::Io { .. }
        )
    }

    /// Instance key the error refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::InvalidKey { key, .. }
            | Self::BootTimeout { key, .. }
            | Self::ProcessDied { key, .. }
            | Self::EvalTimeout { key, .. }
            | Self::Spawn { key, .. }
            | Self::Io { key, .. } => Some(key),
            Self::ShutDown | Self::Config(_) => None,
        }
    }
}

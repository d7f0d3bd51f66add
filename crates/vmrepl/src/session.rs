//! One supervised instance: child process, terminal channel, timing metadata
//! and the gate that serializes every state-changing operation.
//!
//! State machine:
//!
//! ```text
//! Stopped --boot--> Booting --prompt--> Ready --evaluate--> Evaluating --prompt--> Ready
//!    ^                                                                              |
//!    +------------------------------ Killing <---------------- kill (any state) -----+
//! ```
//!
//! The gate is a FIFO `tokio::sync::Mutex`; callers on the same key queue in
//! arrival order. Queries (`is_running`, `started_at`, `info`) read a separate
//! status record and never wait for the gate.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::time::Instant;

use crate::config::{LaunchCommand, SupervisorConfig};
use crate::error::{SupervisorError, SupervisorResult};
use crate::key::InstanceKey;
use crate::process::{ExitInfo, ProcessHandle, ShutdownOutcome, ShutdownPlan, force_kill_group};
use crate::protocol::PromptMatcher;
use crate::terminal::{self, READ_CHUNK, ReadOutcome, TerminalChannel};

// ============================================================================
// Session State
// ============================================================================

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No child process.
    Stopped,
    /// Child launched, waiting for the first prompt.
    Booting,
    /// Prompt seen, waiting for input.
    Ready,
    /// A request line was sent, waiting for the next prompt.
    Evaluating,
    /// Teardown in progress.
    Killing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Booting => write!(f, "booting"),
            Self::Ready => write!(f, "ready"),
            Self::Evaluating => write!(f, "evaluating"),
            Self::Killing => write!(f, "killing"),
        }
    }
}

/// Information about a session (for external queries).
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: InstanceKey,
    pub state: SessionState,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Local>>,
    pub idle_secs: u64,
}

// ============================================================================
// Session Settings
// ============================================================================

/// Per-session view of the supervisor configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub boot_timeout: Duration,
    pub eval_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown: ShutdownPlan,
    pub matcher: PromptMatcher,
    pub launch: LaunchCommand,
    pub working_dir: PathBuf,
}

impl SessionSettings {
    /// Build settings from a validated config, resolving the working directory.
    pub fn from_config(config: &SupervisorConfig) -> SupervisorResult<Self> {
        config.validate()?;
        Ok(Self {
            boot_timeout: config.boot_timeout,
            eval_timeout: config.eval_timeout,
            poll_interval: config.poll_interval,
            shutdown: ShutdownPlan::new(config.kill_grace),
            matcher: PromptMatcher::new(config.prompt.clone()),
            working_dir: config.launch.resolve_working_dir()?,
            launch: config.launch.clone(),
        })
    }
}

// ============================================================================
// Internal Session Structure
// ============================================================================

/// State owned by the gate.
#[derive(Debug)]
struct Running {
    state: SessionState,
    process: Option<ProcessHandle>,
    channel: Option<TerminalChannel>,
    /// Bytes read since the last prompt match.
    pending_output: Vec<u8>,
}

/// Status readable without the gate.
#[derive(Debug, Clone)]
struct Status {
    state: SessionState,
    pid: Option<u32>,
    exit_rx: Option<watch::Receiver<Option<ExitInfo>>>,
    started_at: Option<DateTime<Local>>,
    last_activity: Instant,
}

/// A supervised instance.
#[derive(Debug)]
pub struct Session {
    key: InstanceKey,
    settings: Arc<SessionSettings>,
    gate: Mutex<Running>,
    status: StdMutex<Status>,
}

/// Why waiting for the prompt ended without seeing it.
enum WaitFailure {
    Timeout,
    Died(String),
    Io(std::io::Error),
}

impl Session {
    /// Create an empty, stopped session.
    pub fn new(key: InstanceKey, settings: Arc<SessionSettings>) -> Self {
        Self {
            key,
            settings,
            gate: Mutex::new(Running {
                state: SessionState::Stopped,
                process: None,
                channel: None,
                pending_output: Vec::new(),
            }),
            status: StdMutex::new(Status {
                state: SessionState::Stopped,
                pid: None,
                exit_rx: None,
                started_at: None,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    fn status(&self) -> StdMutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the gate, waiting behind earlier callers.
    pub async fn lock(&self) -> SessionGuard<'_> {
        SessionGuard {
            session: self,
            running: self.gate.lock().await,
        }
    }

    /// Acquire the gate only if nobody holds it.
    pub fn try_lock(&self) -> Option<SessionGuard<'_>> {
        self.gate.try_lock().ok().map(|running| SessionGuard {
            session: self,
            running,
        })
    }

    // ========================================================================
    // Queries (never wait for the gate)
    // ========================================================================

    /// Last state recorded by an operation.
    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Whether a child process is alive for this session.
    pub fn is_running(&self) -> bool {
        let status = self.status();
        status.state != SessionState::Stopped
            && status
                .exit_rx
                .as_ref()
                .is_some_and(|rx| rx.borrow().is_none())
    }

    /// When the current instance was launched.
    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.status().started_at
    }

    /// Time since the last boot, evaluation or restart.
    pub fn idle_for(&self) -> Duration {
        self.status().last_activity.elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        let running = self.is_running();
        let status = self.status();
        SessionInfo {
            key: self.key.clone(),
            state: status.state,
            running,
            pid: status.pid,
            started_at: status.started_at,
            idle_secs: status.last_activity.elapsed().as_secs(),
        }
    }

    // ========================================================================
    // Gated operations
    // ========================================================================

    /// Make sure the instance is running and ready.
    pub async fn ensure_running(&self) -> SupervisorResult<()> {
        self.lock().await.ensure_ready().await.map(|_| ())
    }

    /// Boot if needed, then evaluate one line.
    pub async fn evaluate(&self, input: &str) -> SupervisorResult<String> {
        self.lock().await.evaluate(input).await
    }

    /// Kill and boot under a single gate acquisition.
    pub async fn restart(&self) -> SupervisorResult<String> {
        self.lock().await.restart().await
    }

    /// Stop the instance. Idempotent.
    pub async fn kill(&self) -> Option<ShutdownOutcome> {
        self.lock().await.kill().await
    }

    /// Synchronous last-resort teardown: SIGKILL the process group and, if the
    /// gate is free, release the channel. Safe to race with any other path.
    pub fn emergency_kill(&self) {
        let pid = {
            let status = self.status();
            let alive = status
                .exit_rx
                .as_ref()
                .is_some_and(|rx| rx.borrow().is_none());
            status.pid.filter(|_| alive)
        };
        if let Some(pid) = pid {
            force_kill_group(pid);
        }

        if let Some(mut guard) = self.try_lock() {
            if let Some(mut channel) = guard.running.channel.take() {
                channel.close();
            }
            guard.running.process.take();
            guard.running.pending_output.clear();
            guard.set_state(SessionState::Stopped);
        }
    }
}

// ============================================================================
// Session Guard
// ============================================================================

/// Exclusive access to a session for the duration of one operation.
pub struct SessionGuard<'a> {
    session: &'a Session,
    running: MutexGuard<'a, Running>,
}

impl SessionGuard<'_> {
    fn key(&self) -> &InstanceKey {
        &self.session.key
    }

    fn settings(&self) -> &SessionSettings {
        &self.session.settings
    }

    fn set_state(&mut self, state: SessionState) {
        if self.running.state != state {
            debug!(
                "Session '{}' {} -> {}",
                self.session.key, self.running.state, state
            );
        }
        self.running.state = state;

        let mut status = self.session.status();
        status.state = state;
        if state == SessionState::Stopped {
            status.pid = None;
            status.exit_rx = None;
            status.started_at = None;
        }
    }

    fn touch(&self) {
        self.session.status().last_activity = Instant::now();
    }

    /// Bring the session to `Ready`, booting if necessary.
    ///
    /// Returns the cleaned boot output when a boot happened. After a boot
    /// timeout the child is left running in `Booting`; calling this again
    /// resumes waiting for its prompt instead of launching a second child.
    pub async fn ensure_ready(&mut self) -> SupervisorResult<Option<String>> {
        let state = self.running.state;
        match state {
            SessionState::Ready => {
                if self.child_exited() {
                    let detail = self.exit_detail().await;
                    warn!("Session '{}' child exited while idle ({})", self.key(), detail);
                    self.kill().await;
                    self.launch()?;
                } else {
                    self.touch();
                    return Ok(None);
                }
            }
            SessionState::Booting => {
                debug!("Session '{}' resuming boot wait", self.key());
            }
            SessionState::Stopped => self.launch()?,
            SessionState::Evaluating | SessionState::Killing => {
                // A previous operation was cancelled mid-flight; its output
                // can no longer be attributed, so start over.
                warn!(
                    "Session '{}' found in {} after an interrupted operation, restarting",
                    self.key(),
                    state
                );
                self.kill().await;
                self.launch()?;
            }
        }
        self.wait_boot().await.map(Some)
    }

    /// Launch the child and transition to `Booting`.
    fn launch(&mut self) -> SupervisorResult<()> {
        let key = self.key().clone();
        let settings = self.session.settings.clone();
        let args = settings.launch.args_for(&key);

        let (channel, subordinate) = terminal::open().map_err(|source| SupervisorError::Io {
            key: key.to_string(),
            source,
        })?;
        let process = ProcessHandle::spawn(
            key.as_str(),
            &settings.launch.program,
            &args,
            &settings.working_dir,
            subordinate,
        )
        .map_err(|source| SupervisorError::Spawn {
            key: key.to_string(),
            source,
        })?;

        info!(
            "Session '{}' launched {} {} (pid={})",
            key,
            settings.launch.program,
            args.join(" "),
            process.pid
        );

        {
            let mut status = self.session.status();
            status.pid = Some(process.pid);
            status.exit_rx = Some(process.exit_watch());
            status.started_at = Some(Local::now());
            status.last_activity = Instant::now();
        }
        self.running.pending_output.clear();
        self.running.channel = Some(channel);
        self.running.process = Some(process);
        self.set_state(SessionState::Booting);
        Ok(())
    }

    async fn wait_boot(&mut self) -> SupervisorResult<String> {
        let timeout = self.settings().boot_timeout;
        let started = Instant::now();
        match self.wait_for_prompt(timeout).await {
            Ok(output) => {
                info!(
                    "Session '{}' ready after {:?}",
                    self.key(),
                    started.elapsed()
                );
                self.set_state(SessionState::Ready);
                self.touch();
                Ok(output)
            }
            Err(WaitFailure::Timeout) => {
                warn!(
                    "Session '{}' printed no prompt within {:?}; leaving it booting",
                    self.key(),
                    timeout
                );
                Err(SupervisorError::BootTimeout {
                    key: self.key().to_string(),
                    timeout,
                })
            }
            Err(failure) => Err(self.fail(failure).await),
        }
    }

    /// Boot if needed, send `input` as one line, and return the response.
    pub async fn evaluate(&mut self, input: &str) -> SupervisorResult<String> {
        self.ensure_ready().await?;

        self.discard_stale_output();
        self.set_state(SessionState::Evaluating);
        self.touch();

        let started = Instant::now();
        let request = PromptMatcher::encode_request(input);
        let write_result = match self.running.channel.as_ref() {
            Some(channel) => channel.write(&request).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "terminal channel missing",
            )),
        };
        if let Err(e) = write_result {
            return Err(self.fail(WaitFailure::Io(e)).await);
        }

        let timeout = self.settings().eval_timeout;
        match self.wait_for_prompt(timeout).await {
            Ok(output) => {
                let response = self.settings().matcher.extract_response(&output);
                self.set_state(SessionState::Ready);
                self.touch();
                debug!(
                    "Session '{}' evaluated {} bytes in {:?}",
                    self.key(),
                    input.len(),
                    started.elapsed()
                );
                Ok(response)
            }
            Err(WaitFailure::Timeout) => {
                warn!(
                    "Session '{}' gave no response within {:?}; stopping it",
                    self.key(),
                    timeout
                );
                self.kill().await;
                Err(SupervisorError::EvalTimeout {
                    key: self.key().to_string(),
                    timeout,
                })
            }
            Err(failure) => Err(self.fail(failure).await),
        }
    }

    /// Kill then boot, without releasing the gate in between.
    pub async fn restart(&mut self) -> SupervisorResult<String> {
        info!("Session '{}' restarting", self.key());
        self.kill().await;
        self.touch();
        Ok(self.ensure_ready().await?.unwrap_or_default())
    }

    /// Stop the child and release the channel. Idempotent; never fails.
    ///
    /// Returns what the shutdown protocol had to do, or `None` when there was
    /// nothing to stop.
    pub async fn kill(&mut self) -> Option<ShutdownOutcome> {
        if self.running.state == SessionState::Stopped
            && self.running.process.is_none()
            && self.running.channel.is_none()
        {
            return None;
        }

        self.set_state(SessionState::Killing);
        let plan = self.settings().shutdown;
        let outcome = match self.running.process.as_ref() {
            Some(process) => Some(process.shutdown(plan).await),
            None => None,
        };

        if let Some(mut channel) = self.running.channel.take() {
            channel.close();
        }
        self.running.process = None;
        self.running.pending_output.clear();
        self.set_state(SessionState::Stopped);

        info!("Session '{}' stopped ({:?})", self.key(), outcome);
        outcome
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn child_exited(&self) -> bool {
        self.running
            .process
            .as_ref()
            .is_none_or(ProcessHandle::has_exited)
    }

    async fn exit_detail(&self) -> String {
        match self.running.process.as_ref() {
            Some(process) => match process.wait_exit_timeout(Duration::from_millis(200)).await {
                Some(info) => info.to_string(),
                None => "terminal closed".to_string(),
            },
            None => "no process".to_string(),
        }
    }

    /// Tear down after a death or I/O failure and build the caller's error.
    async fn fail(&mut self, failure: WaitFailure) -> SupervisorError {
        let key = self.key().to_string();
        let err = match failure {
            WaitFailure::Died(detail) => {
                warn!("Session '{}' process died: {}", key, detail);
                SupervisorError::ProcessDied { key, detail }
            }
            WaitFailure::Io(source) => {
                warn!("Session '{}' terminal error: {}", key, source);
                SupervisorError::Io { key, source }
            }
            WaitFailure::Timeout => SupervisorError::EvalTimeout {
                key,
                timeout: self.settings().eval_timeout,
            },
        };
        self.kill().await;
        err
    }

    /// Drop output that arrived after the last prompt so it cannot be
    /// mistaken for the next response.
    fn discard_stale_output(&mut self) {
        let Running {
            channel,
            pending_output,
            ..
        } = &mut *self.running;
        if let Some(channel) = channel.as_ref() {
            while let Ok(ReadOutcome::Data(bytes)) = channel.try_read(READ_CHUNK) {
                pending_output.extend_from_slice(&bytes);
            }
        }
        if !pending_output.is_empty() {
            debug!(
                "Session '{}' discarding {} bytes of unsolicited output",
                self.session.key,
                pending_output.len()
            );
            pending_output.clear();
        }
    }

    /// Read until the accumulated output ends with the prompt, the child
    /// dies, or `timeout` elapses. Waits are bounded by the poll interval and
    /// woken early by channel readability or child exit.
    async fn wait_for_prompt(&mut self, timeout: Duration) -> Result<String, WaitFailure> {
        let deadline = Instant::now() + timeout;
        let poll_interval = self.session.settings.poll_interval;
        let Running {
            process,
            channel,
            pending_output,
            ..
        } = &mut *self.running;
        let (Some(process), Some(channel)) = (process.as_ref(), channel.as_ref()) else {
            return Err(WaitFailure::Died("no process".to_string()));
        };
        let matcher = &self.session.settings.matcher;

        loop {
            let mut closed = false;
            loop {
                match channel.try_read(READ_CHUNK) {
                    Ok(ReadOutcome::Data(bytes)) => pending_output.extend_from_slice(&bytes),
                    Ok(ReadOutcome::Empty) => break,
                    Ok(ReadOutcome::Closed) => {
                        closed = true;
                        break;
                    }
                    Err(e) => return Err(WaitFailure::Io(e)),
                }
            }

            if let Some(output) = matcher.take_ready(pending_output) {
                pending_output.clear();
                return Ok(output);
            }

            if closed || process.has_exited() {
                let detail = match process.wait_exit_timeout(Duration::from_millis(200)).await {
                    Some(info) => info.to_string(),
                    None => "terminal closed".to_string(),
                };
                return Err(WaitFailure::Died(detail));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitFailure::Timeout);
            }
            let step = poll_interval.min(deadline - now);

            tokio::select! {
                res = channel.wait_readable(step) => {
                    if let Err(e) = res {
                        return Err(WaitFailure::Io(e));
                    }
                }
                _ = process.wait_exit() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Stopped.to_string(), "stopped");
        assert_eq!(SessionState::Booting.to_string(), "booting");
        assert_eq!(SessionState::Ready.to_string(), "ready");
        assert_eq!(SessionState::Evaluating.to_string(), "evaluating");
        assert_eq!(SessionState::Killing.to_string(), "killing");
    }

    #[test]
    fn test_session_state_serialization() {
        let json = serde_json::to_string(&SessionState::Evaluating).unwrap();
        assert_eq!(json, "\"evaluating\"");
        let parsed: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, SessionState::Evaluating);
    }

    #[tokio::test]
    async fn test_new_session_is_stopped() {
        let mut config = SupervisorConfig::default();
        config.launch = LaunchCommand::new("/bin/sh", ["-c", "true"]).with_working_dir("/tmp");
        let settings = Arc::new(SessionSettings::from_config(&config).unwrap());
        let key = InstanceKey::parse("aarch64", &config.valid_keys).unwrap();
        let session = Session::new(key, settings);

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.is_running());
        assert!(session.started_at().is_none());
        assert_eq!(session.kill().await, None);
        assert_eq!(session.kill().await, None);
        session.emergency_kill();
        assert_eq!(session.info().state, SessionState::Stopped);
    }
}

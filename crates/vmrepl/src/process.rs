//! Process handling for supervised instances.
//!
//! Children are launched in their own session (and therefore their own
//! process group) so that the launcher and everything it starts can be
//! signalled together. Exit is observed by a background task that owns the
//! `Child` and publishes the status on a watch channel.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use log::{debug, info, warn};
use rustix::io::Errno;
use rustix::process::{Pid, Signal, kill_process_group};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::terminal::Subordinate;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, if it exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if it was killed.
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Two-phase shutdown: SIGTERM to the group, wait up to `grace`; then SIGKILL
/// and wait up to `reap` for the exit to be observed.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownPlan {
    pub grace: Duration,
    pub reap: Duration,
}

impl ShutdownPlan {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            reap: Duration::from_secs(5),
        }
    }
}

/// What the shutdown protocol had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The child was already gone before any signal was needed.
    AlreadyExited,
    /// The child exited within the grace window after SIGTERM.
    Graceful,
    /// SIGKILL was required.
    Forced,
    /// SIGKILL was sent but the exit was not observed within the reap window.
    Unconfirmed,
}

/// Handle to a launched instance.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Process ID (also the process group ID).
    pub pid: u32,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    waiter: JoinHandle<()>,
}

impl ProcessHandle {
    /// Launch `program` with the subordinate terminal on stdin/stdout/stderr.
    ///
    /// The subordinate handle is closed in this process before returning.
    pub fn spawn(
        label: &str,
        program: &str,
        args: &[String],
        cwd: &Path,
        subordinate: Subordinate,
    ) -> io::Result<Self> {
        let (stdin, stdout, stderr) = subordinate.into_stdio()?;

        debug!("[{}] launching {} {:?} in {}", label, program, args, cwd.display());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);

        // New session: the child leads a fresh process group and has no
        // controlling terminal inherited from us.
        unsafe {
            cmd.pre_exec(|| {
                rustix::process::setsid()
                    .map(|_| ())
                    .map_err(io::Error::from)
            });
        }

        let mut child = cmd.spawn()?;
        // Drop the parent's copies of the subordinate handles.
        drop(cmd);

        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("launched process exited before reporting a pid"))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let waiter = {
            let label = label.to_string();
            tokio::spawn(async move {
                let info = match child.wait().await {
                    Ok(status) => ExitInfo::from(status),
                    Err(e) => {
                        warn!("[{}] error waiting for pid {}: {}", label, pid, e);
                        ExitInfo::unknown()
                    }
                };
                debug!("[{}] pid {} exited: {}", label, pid, info);
                let _ = exit_tx.send(Some(info));
            })
        };

        info!("[{}] launched {} (pid={})", label, program, pid);
        Ok(Self {
            pid,
            exit_rx,
            waiter,
        })
    }

    /// Exit status, if the child has exited.
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// A receiver that observes the exit without borrowing the handle.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Wait for the child to exit.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(info) => (*info).unwrap_or_else(ExitInfo::unknown),
            // Waiter task is gone without reporting; treat as exited.
            Err(_) => ExitInfo::unknown(),
        }
    }

    /// Wait for the child to exit, at most `limit`.
    pub async fn wait_exit_timeout(&self, limit: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(limit, self.wait_exit()).await.ok()
    }

    /// Send `signal` to the whole process group. Returns `false` when the
    /// group no longer exists.
    pub fn signal_group(&self, signal: Signal) -> bool {
        signal_process_group(self.pid, signal)
    }

    /// Run the two-phase shutdown protocol.
    pub async fn shutdown(&self, plan: ShutdownPlan) -> ShutdownOutcome {
        if self.has_exited() {
            // Sweep anything the launcher left behind in its group.
            self.signal_group(Signal::KILL);
            return ShutdownOutcome::AlreadyExited;
        }

        self.signal_group(Signal::TERM);
        if self.wait_exit_timeout(plan.grace).await.is_some() {
            return ShutdownOutcome::Graceful;
        }

        debug!(
            "pid {} still alive after {:?}, escalating to SIGKILL",
            self.pid, plan.grace
        );
        self.signal_group(Signal::KILL);
        if self.wait_exit_timeout(plan.reap).await.is_some() {
            ShutdownOutcome::Forced
        } else {
            warn!(
                "pid {} did not exit within {:?} after SIGKILL",
                self.pid, plan.reap
            );
            ShutdownOutcome::Unconfirmed
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.has_exited() {
            // The waiter keeps reaping in the background; only an orphaned
            // handle (no shutdown ran) gets here with a live child.
            force_kill_group(self.pid);
        } else {
            self.waiter.abort();
        }
    }
}

/// Send `signal` to process group `pgid`, suppressing "no such process".
fn signal_process_group(pgid: u32, signal: Signal) -> bool {
    let Some(pid) = i32::try_from(pgid).ok().and_then(Pid::from_raw) else {
        return false;
    };
    match kill_process_group(pid, signal) {
        Ok(()) => true,
        Err(e) if e == Errno::SRCH => false,
        Err(e) => {
            debug!("signalling process group {} failed: {}", pgid, e);
            false
        }
    }
}

/// Synchronously SIGKILL process group `pgid`. Used on the emergency exit
/// path where nothing can be awaited.
pub fn force_kill_group(pgid: u32) -> bool {
    signal_process_group(pgid, Signal::KILL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal;

    fn spawn_sh(script: &str) -> (ProcessHandle, terminal::TerminalChannel) {
        let (channel, sub) = terminal::open().unwrap();
        let handle = ProcessHandle::spawn(
            "test",
            "/bin/sh",
            &["-c".to_string(), script.to_string()],
            Path::new("/tmp"),
            sub,
        )
        .unwrap();
        (handle, channel)
    }

    #[tokio::test]
    async fn test_exit_status_is_published() {
        let (handle, _channel) = spawn_sh("exit 3");
        let info = handle.wait_exit().await;
        assert_eq!(info.code, Some(3));
        assert!(handle.has_exited());
        assert_eq!(info.to_string(), "exit status 3");
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let (handle, _channel) = spawn_sh("sleep 60");
        assert!(!handle.has_exited());
        let outcome = handle
            .shutdown(ShutdownPlan::new(Duration::from_secs(2)))
            .await;
        assert_eq!(outcome, ShutdownOutcome::Graceful);
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_forced_shutdown_when_term_is_ignored() {
        let (handle, _channel) = spawn_sh("trap '' TERM; sleep 60");
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = handle
            .shutdown(ShutdownPlan::new(Duration::from_millis(200)))
            .await;
        assert_eq!(outcome, ShutdownOutcome::Forced);
        assert_eq!(handle.exit_status().and_then(|i| i.signal), Some(9));
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_harmless() {
        let (handle, _channel) = spawn_sh("sleep 60");
        let plan = ShutdownPlan::new(Duration::from_secs(2));
        handle.shutdown(plan).await;
        assert_eq!(handle.shutdown(plan).await, ShutdownOutcome::AlreadyExited);
    }

    #[test]
    fn test_signal_missing_group_is_suppressed() {
        // Above the largest possible pid_max (2^22).
        assert!(!force_kill_group(99_999_999));
        assert!(!force_kill_group(0));
    }
}

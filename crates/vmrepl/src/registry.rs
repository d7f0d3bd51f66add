//! Registry of supervised instances.
//!
//! Maps each valid key to at most one [`Session`], created on first use.
//! Operations on different keys never wait for each other; operations on the
//! same key queue on that session's gate. An idle reaper task, started on
//! first use, stops sessions that have seen no activity for the configured
//! idle timeout.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Local};
use dashmap::DashMap;
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::key::InstanceKey;
use crate::session::{Session, SessionInfo, SessionSettings, SessionState};

/// Registry of supervised instances. Construct once and share.
#[derive(Debug)]
pub struct Registry {
    config: SupervisorConfig,
    settings: Arc<SessionSettings>,
    sessions: DashMap<InstanceKey, Arc<Session>>,
    reaper: StdMutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Set by either shutdown path; rejects new work.
    shut_down: AtomicBool,
    /// Set once the async shutdown has started.
    draining: AtomicBool,
}

impl Registry {
    /// Create a registry. Fails if the configuration is invalid or the
    /// working directory cannot be resolved.
    pub fn new(config: SupervisorConfig) -> SupervisorResult<Arc<Self>> {
        let settings = Arc::new(SessionSettings::from_config(&config)?);
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            "Registry created (keys: {}, prompt: {:?}, cwd: {})",
            config.valid_keys_display(),
            config.prompt,
            settings.working_dir.display()
        );

        Ok(Arc::new(Self {
            config,
            settings,
            sessions: DashMap::new(),
            reaper: StdMutex::new(None),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Valid keys, sorted.
    pub fn valid_keys(&self) -> impl Iterator<Item = &str> {
        self.config.valid_keys.iter().map(String::as_str)
    }

    /// Normalize and validate a caller-supplied key.
    pub fn parse_key(&self, raw: &str) -> SupervisorResult<InstanceKey> {
        InstanceKey::parse(raw, &self.config.valid_keys)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> SupervisorResult<()> {
        if self.is_shut_down() {
            return Err(SupervisorError::ShutDown);
        }
        Ok(())
    }

    fn session(&self, key: &InstanceKey) -> Arc<Session> {
        self.sessions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Session::new(key.clone(), Arc::clone(&self.settings))))
            .clone()
    }

    fn existing(&self, raw: &str) -> SupervisorResult<Option<Arc<Session>>> {
        let key = self.parse_key(raw)?;
        Ok(self.sessions.get(&key).map(|s| Arc::clone(s.value())))
    }

    // ========================================================================
    // Gated operations
    // ========================================================================

    /// Boot the instance for `key` unless it is already running.
    pub async fn ensure_running(self: &Arc<Self>, key: &str) -> SupervisorResult<()> {
        let key = self.parse_key(key)?;
        self.ensure_open()?;
        self.start_reaper();

        let session = self.session(&key);
        let mut guard = session.lock().await;
        self.ensure_open()?;
        guard.ensure_ready().await.map(|_| ())
    }

    /// Evaluate one line on `key`, booting first if needed.
    pub async fn evaluate(self: &Arc<Self>, key: &str, input: &str) -> SupervisorResult<String> {
        let key = self.parse_key(key)?;
        self.ensure_open()?;
        self.start_reaper();

        let session = self.session(&key);
        let mut guard = session.lock().await;
        self.ensure_open()?;
        guard.evaluate(input).await
    }

    /// Kill and reboot `key` as one operation. Returns the boot output.
    pub async fn restart(self: &Arc<Self>, key: &str) -> SupervisorResult<String> {
        let key = self.parse_key(key)?;
        self.ensure_open()?;
        self.start_reaper();

        let session = self.session(&key);
        let mut guard = session.lock().await;
        self.ensure_open()?;
        guard.restart().await
    }

    /// Stop `key` if it is running. Idempotent.
    pub async fn kill(&self, key: &str) -> SupervisorResult<()> {
        if let Some(session) = self.existing(key)? {
            session.kill().await;
        }
        Ok(())
    }

    // ========================================================================
    // Queries (never wait for a gate)
    // ========================================================================

    /// Whether a child process is alive for `key`. Never boots anything.
    pub fn is_running(&self, key: &InstanceKey) -> bool {
        self.sessions.get(key).is_some_and(|s| s.is_running())
    }

    /// When the current instance for `key` was launched, if one is running.
    pub fn started_at(&self, key: &InstanceKey) -> Option<DateTime<Local>> {
        self.sessions.get(key).and_then(|s| s.started_at())
    }

    /// Status of every valid key, in key order.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.config
            .valid_keys
            .iter()
            .filter_map(|raw| self.parse_key(raw).ok())
            .map(|key| match self.sessions.get(&key) {
                Some(session) => session.info(),
                None => SessionInfo {
                    key,
                    state: SessionState::Stopped,
                    running: false,
                    pid: None,
                    started_at: None,
                    idle_secs: 0,
                },
            })
            .collect()
    }

    // ========================================================================
    // Idle reaper
    // ========================================================================

    fn start_reaper(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if reaper.is_some() || self.is_shut_down() {
            return;
        }

        let interval = self.config.idle_check_interval;
        let registry = Arc::downgrade(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *reaper = Some(tokio::spawn(reaper_loop(registry, interval, shutdown_rx)));
        debug!("Idle reaper started (interval {:?})", interval);
    }

    /// One reaper pass. Stops every session whose child died or that has been
    /// idle for at least the idle timeout. Sessions whose gate is held are
    /// skipped until the next pass. Returns the number of sessions stopped.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut reaped = 0;
        for session in sessions {
            if !should_reap(&session, idle_timeout) {
                continue;
            }
            let Some(mut guard) = session.try_lock() else {
                debug!("Session '{}' busy, skipping idle check", session.key());
                continue;
            };
            // Activity may have happened between the check and the lock.
            if !should_reap(&session, idle_timeout) {
                continue;
            }

            info!(
                "Stopping idle session '{}' (idle {:?})",
                session.key(),
                session.idle_for()
            );
            match AssertUnwindSafe(guard.kill()).catch_unwind().await {
                Ok(_) => reaped += 1,
                Err(_) => error!("Panic while stopping idle session '{}'", session.key()),
            }
        }
        reaped
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the reaper and every session. Later operations fail with
    /// [`SupervisorError::ShutDown`]. Idempotent. Still stops every session
    /// under its gate when [`emergency_shutdown`](Self::emergency_shutdown)
    /// ran first.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down registry");

        let _ = self.shutdown_tx.send(());
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reaper
            && let Err(e) = handle.await
        {
            warn!("Idle reaper ended abnormally: {}", e);
        }

        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            session.kill().await;
        }
        info!("Registry shut down");
    }

    /// Synchronous teardown for exit paths that cannot await: signal
    /// handlers, panic hooks, `Drop`. Sends SIGKILL to every live process
    /// group. Safe to call more than once and alongside `shutdown`.
    pub fn emergency_shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        for entry in self.sessions.iter() {
            entry.value().emergency_kill();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.emergency_shutdown();
    }
}

fn should_reap(session: &Session, idle_timeout: Duration) -> bool {
    if session.state() == SessionState::Stopped {
        return false;
    }
    !session.is_running() || session.idle_for() >= idle_timeout
}

async fn reaper_loop(
    registry: Weak<Registry>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let reaped = registry.reap_idle().await;
                if reaped > 0 {
                    debug!("Idle reaper stopped {} session(s)", reaped);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Idle reaper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchCommand;

    fn registry() -> Arc<Registry> {
        let mut config = SupervisorConfig::default();
        config.launch = LaunchCommand::new("/bin/sh", ["-c", "true"]).with_working_dir("/tmp");
        Registry::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_queries_on_unstarted_keys() {
        let registry = registry();
        let aarch64 = registry.parse_key("aarch64").unwrap();
        let x86_64 = registry.parse_key(" X86_64 ").unwrap();
        assert!(!registry.is_running(&aarch64));
        assert!(!registry.is_running(&x86_64));
        assert!(registry.started_at(&aarch64).is_none());
        // Queries never create a session.
        assert!(registry.sessions.is_empty());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|info| info.state == SessionState::Stopped));
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected_everywhere() {
        let registry = registry();
        let err = registry.parse_key("riscv").unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidKey { .. }));
        assert!(err.to_string().contains("aarch64, x86_64"));

        assert!(registry.evaluate("riscv", "1").await.is_err());
        assert!(registry.ensure_running("riscv").await.is_err());
        assert!(registry.restart("").await.is_err());
        assert!(registry.kill("riscv").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = SupervisorConfig::default();
        config.prompt = String::new();
        assert!(matches!(
            Registry::new(config).unwrap_err(),
            SupervisorError::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_final() {
        let registry = registry();
        registry.shutdown().await;
        registry.shutdown().await;
        registry.emergency_shutdown();

        assert!(registry.is_shut_down());
        assert!(matches!(
            registry.evaluate("aarch64", "1").await.unwrap_err(),
            SupervisorError::ShutDown
        ));
        assert!(matches!(
            registry.ensure_running("aarch64").await.unwrap_err(),
            SupervisorError::ShutDown
        ));
    }

    #[tokio::test]
    async fn test_reap_with_no_sessions() {
        let registry = registry();
        assert_eq!(registry.reap_idle().await, 0);
    }
}

//! Supervisor configuration.
//!
//! The timing and protocol constants are fixed for the lifetime of a
//! [`Registry`](crate::Registry): they are read once at construction and never
//! changed per call.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SupervisorError, SupervisorResult};
use crate::key::InstanceKey;

/// Maximum wait for the first ready-prompt after launching an instance.
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum wait for the ready-prompt that follows a submitted line.
pub const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Inactivity after which the idle reaper kills an instance.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the idle reaper sweep.
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Window between the graceful and the forceful termination signal.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(1);

/// Upper bound on a single wait step while polling for the prompt.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Ready-prompt marker. An instance is ready when its cleaned output ends
/// with this string.
pub const DEFAULT_PROMPT: &str = "lona> ";

/// Instance keys accepted by default.
pub const DEFAULT_VALID_KEYS: &[&str] = &["aarch64", "x86_64"];

/// Key used by the tool layer when the caller names none.
pub const DEFAULT_KEY: &str = "aarch64";

/// Placeholder substituted with the instance key in launch arguments.
pub const KEY_PLACEHOLDER: &str = "{key}";

/// How an instance is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments; every `{key}` is replaced with the instance key.
    pub args: Vec<String>,
    /// Working directory. `None` means the discovered project root.
    pub working_dir: Option<PathBuf>,
}

impl Default for LaunchCommand {
    fn default() -> Self {
        Self {
            program: "make".to_string(),
            args: vec![format!("run-{KEY_PLACEHOLDER}")],
            working_dir: None,
        }
    }
}

impl LaunchCommand {
    /// Create a launch command running `program` with `args`.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Arguments with the instance key substituted.
    pub fn args_for(&self, key: &InstanceKey) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(KEY_PLACEHOLDER, key.as_str()))
            .collect()
    }

    /// Working directory to launch in, discovering the project root when
    /// none is configured.
    pub fn resolve_working_dir(&self) -> SupervisorResult<PathBuf> {
        match self.working_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => {
                let cwd = std::env::current_dir().map_err(|e| {
                    SupervisorError::Config(format!("cannot read current directory: {e}"))
                })?;
                find_project_root(&cwd).ok_or_else(|| {
                    SupervisorError::Config(format!(
                        "could not find project root (no Makefile above {})",
                        cwd.display()
                    ))
                })
            }
        }
    }
}

/// Configuration for a [`Registry`](crate::Registry).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub boot_timeout: Duration,
    pub eval_timeout: Duration,
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    pub kill_grace: Duration,
    pub poll_interval: Duration,
    pub prompt: String,
    pub valid_keys: BTreeSet<String>,
    /// Key used when a caller names none. Must be in `valid_keys`.
    pub default_key: String,
    pub launch: LaunchCommand,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            eval_timeout: DEFAULT_EVAL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            kill_grace: DEFAULT_KILL_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            prompt: DEFAULT_PROMPT.to_string(),
            valid_keys: DEFAULT_VALID_KEYS.iter().map(|k| k.to_string()).collect(),
            default_key: DEFAULT_KEY.to_string(),
            launch: LaunchCommand::default(),
        }
    }
}

impl SupervisorConfig {
    /// Check the configuration for values the supervisor cannot work with.
    pub fn validate(&self) -> SupervisorResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(SupervisorError::Config("prompt must not be empty".into()));
        }
        if self.valid_keys.is_empty() {
            return Err(SupervisorError::Config(
                "at least one valid instance key is required".into(),
            ));
        }
        if let Some(bad) = self
            .valid_keys
            .iter()
            .find(|k| k.trim().is_empty() || **k != k.trim().to_lowercase())
        {
            return Err(SupervisorError::Config(format!(
                "instance key '{bad}' must be lowercase without surrounding whitespace"
            )));
        }
        if !self.valid_keys.contains(&self.default_key) {
            return Err(SupervisorError::Config(format!(
                "default key '{}' is not one of: {}",
                self.default_key,
                self.valid_keys_display()
            )));
        }
        if self.launch.program.trim().is_empty() {
            return Err(SupervisorError::Config(
                "launch program must not be empty".into(),
            ));
        }

        let durations = [
            ("boot_timeout", self.boot_timeout),
            ("eval_timeout", self.eval_timeout),
            ("idle_timeout", self.idle_timeout),
            ("idle_check_interval", self.idle_check_interval),
            ("poll_interval", self.poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(SupervisorError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Comma separated list of valid keys, for messages.
    pub fn valid_keys_display(&self) -> String {
        self.valid_keys
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Walk up from `start` to the first directory containing a `Makefile`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join("Makefile").is_file())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.boot_timeout, Duration::from_secs(120));
        assert_eq!(config.eval_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.idle_check_interval, Duration::from_secs(10));
        assert_eq!(config.prompt, "lona> ");
        assert!(config.valid_keys.contains("aarch64"));
        assert!(config.valid_keys.contains("x86_64"));
        assert_eq!(config.default_key, DEFAULT_KEY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_launch_args_substitute_key() {
        let launch = LaunchCommand::default();
        let key = InstanceKey::parse("x86_64", &SupervisorConfig::default().valid_keys).unwrap();
        assert_eq!(launch.program, "make");
        assert_eq!(launch.args_for(&key), vec!["run-x86_64".to_string()]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SupervisorConfig::default();
        config.prompt = "  ".into();
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.valid_keys.clear();
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.valid_keys.insert("ARM".into());
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.default_key = "riscv64".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("riscv64"));

        let mut config = SupervisorConfig::default();
        config.eval_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("eval_timeout"));
    }

    #[test]
    fn test_find_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("Makefile"), "all:\n").unwrap();

        assert_eq!(find_project_root(&nested), Some(dir.path().to_path_buf()));
    }

    #[test]
    fn test_explicit_working_dir_wins() {
        let launch = LaunchCommand::new("sh", ["-c", "true"]).with_working_dir("/tmp");
        assert_eq!(launch.resolve_working_dir().unwrap(), PathBuf::from("/tmp"));
    }
}

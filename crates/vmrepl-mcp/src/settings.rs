//! User configuration: TOML file plus `VMREPL__*` environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, info};
use serde::{Deserialize, Serialize};
use vmrepl::config::{
    DEFAULT_BOOT_TIMEOUT, DEFAULT_EVAL_TIMEOUT, DEFAULT_IDLE_CHECK_INTERVAL, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_KEY, DEFAULT_KILL_GRACE, DEFAULT_POLL_INTERVAL, DEFAULT_PROMPT, DEFAULT_VALID_KEYS,
};
use vmrepl::{LaunchCommand, SupervisorConfig};

pub const APP_NAME: &str = "vmrepl";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub supervisor: SupervisorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::Info)
    }
}

/// Supervisor settings as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub boot_timeout_secs: u64,
    pub eval_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
    pub kill_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub prompt: String,
    pub valid_keys: Vec<String>,
    pub default_key: String,
    pub launch: LaunchCommand,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            boot_timeout_secs: DEFAULT_BOOT_TIMEOUT.as_secs(),
            eval_timeout_secs: DEFAULT_EVAL_TIMEOUT.as_secs(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            idle_check_interval_secs: DEFAULT_IDLE_CHECK_INTERVAL.as_secs(),
            kill_grace_ms: DEFAULT_KILL_GRACE.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            prompt: DEFAULT_PROMPT.to_string(),
            valid_keys: DEFAULT_VALID_KEYS.iter().map(|k| k.to_string()).collect(),
            default_key: DEFAULT_KEY.to_string(),
            launch: LaunchCommand::default(),
        }
    }
}

impl SupervisorSection {
    /// Convert to the library configuration, normalizing keys and expanding
    /// the working directory.
    pub fn to_supervisor_config(&self) -> Result<SupervisorConfig> {
        let mut launch = self.launch.clone();
        if let Some(dir) = launch.working_dir.take() {
            launch.working_dir = Some(expand_path(dir)?);
        }

        let config = SupervisorConfig {
            boot_timeout: Duration::from_secs(self.boot_timeout_secs),
            eval_timeout: Duration::from_secs(self.eval_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            idle_check_interval: Duration::from_secs(self.idle_check_interval_secs),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            prompt: self.prompt.clone(),
            valid_keys: self
                .valid_keys
                .iter()
                .map(|k| k.trim().to_lowercase())
                .collect(),
            default_key: self.default_key.trim().to_lowercase(),
            launch,
        };
        config.validate().context("validating supervisor configuration")?;
        Ok(config)
    }
}

/// Locations used by the binary.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

/// Load the config file (creating it with defaults when missing unless
/// `dry_run`) layered under environment overrides.
pub fn load_or_init_config(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let defaults = SupervisorSection::default();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default(
            "supervisor.boot_timeout_secs",
            defaults.boot_timeout_secs as i64,
        )?
        .set_default(
            "supervisor.eval_timeout_secs",
            defaults.eval_timeout_secs as i64,
        )?
        .set_default("supervisor.prompt", defaults.prompt)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()
        .context("building configuration")?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("parsing configuration")?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Launch arguments may contain {key}, replaced by the instance key.\n");
    buffer.push_str("# Environment overrides: ");
    buffer.push_str(&env_prefix());
    buffer.push_str("__SECTION__FIELD (e.g. ");
    buffer.push_str(&env_prefix());
    buffer.push_str("__SUPERVISOR__EVAL_TIMEOUT_SECS=60)\n");
    buffer.push('\n');
    buffer
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_section_matches_library_defaults() {
        let config = SupervisorSection::default().to_supervisor_config().unwrap();
        assert_eq!(config.eval_timeout, Duration::from_secs(30));
        assert_eq!(config.kill_grace, Duration::from_secs(1));
        assert_eq!(config.prompt, "lona> ");
        assert_eq!(config.default_key, "aarch64");
        assert_eq!(config.launch.args, vec!["run-{key}".to_string()]);
        assert!(config.launch.working_dir.is_none());
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "VMREPL");
    }

    #[test]
    fn test_write_and_load_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::discover(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(paths.config_file, dir.path().join("config.toml"));

        let config = load_or_init_config(&paths, false).unwrap();
        assert!(paths.config_file.exists());
        let written = fs::read_to_string(&paths.config_file).unwrap();
        assert!(written.starts_with("# Configuration for vmrepl"));
        assert!(written.contains("[supervisor]"));

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.supervisor.idle_timeout_secs, 60);
        assert_eq!(config.supervisor.launch.program, "make");
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        fs::write(
            &file,
            r#"
[supervisor]
eval_timeout_secs = 5
prompt = "user=> "
valid_keys = ["RISCV64", "aarch64"]
default_key = "riscv64"

[supervisor.launch]
program = "qemu-run"
args = ["--arch", "{key}"]
working_dir = "/tmp"
"#,
        )
        .unwrap();

        let paths = AppPaths::discover(Some(file)).unwrap();
        let config = load_or_init_config(&paths, true).unwrap();
        let supervisor = config.supervisor.to_supervisor_config().unwrap();

        assert_eq!(supervisor.eval_timeout, Duration::from_secs(5));
        assert_eq!(supervisor.boot_timeout, Duration::from_secs(120));
        assert_eq!(supervisor.prompt, "user=> ");
        assert!(supervisor.valid_keys.contains("riscv64"));
        assert_eq!(supervisor.default_key, "riscv64");
        assert_eq!(supervisor.launch.program, "qemu-run");
        assert_eq!(supervisor.launch.working_dir, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_invalid_default_key_is_rejected() {
        let section = SupervisorSection {
            default_key: "sparc".to_string(),
            ..SupervisorSection::default()
        };
        let err = section.to_supervisor_config().unwrap_err();
        assert!(format!("{err:#}").contains("sparc"));
    }

    #[test]
    fn test_level_filter() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            file: None,
        };
        assert_eq!(logging.level_filter(), LevelFilter::Debug);
        let logging = LoggingConfig {
            level: "nonsense".to_string(),
            file: None,
        };
        assert_eq!(logging.level_filter(), LevelFilter::Info);
    }
}

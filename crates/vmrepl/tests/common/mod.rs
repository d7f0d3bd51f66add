//! Test utilities and common setup.
//!
//! Instances are played by a small shell script that behaves like a slow
//! booting REPL: it prints a banner, optionally waits, prints `ready> `, then
//! echoes each input line on the prompt line and answers it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vmrepl::{InstanceKey, LaunchCommand, Registry, SupervisorConfig};

pub const PROMPT: &str = "ready> ";

/// Key behavior (`$0` is the instance key):
/// - `fast`: prompt right away
/// - `slow`: prompt after 300ms
/// - `mute`: never prompts
/// - `dead`: exits during boot
///
/// Input lines: `sleep N` answers `slept` after N seconds, `hang` never
/// answers, `exit` quits, `pid` prints the shell's pid, `key` prints the
/// instance key, `noisy` answers `done` and prints a stray line 200ms after
/// its prompt, anything else is evaluated as shell arithmetic.
pub const FAKE_REPL: &str = r#"
key="$0"
echo "booting $key"
case "$key" in
  slow) sleep 0.3 ;;
  mute) sleep 600 ;;
  dead) echo "no kernel"; exit 7 ;;
esac
printf 'ready> '
while IFS= read -r line; do
  printf '%s\n' "$line"
  case "$line" in
    sleep\ *) sleep "${line#sleep }"; echo "slept" ;;
    hang) sleep 600 ;;
    exit) exit 0 ;;
    pid) echo "$$" ;;
    key) echo "$key" ;;
    noisy) echo "done"; printf 'ready> '; sleep 0.2; echo "late noise"; continue ;;
    *) echo "$(($line))" ;;
  esac
  printf 'ready> '
done
"#;

/// Initialize test logging once. Controlled by `RUST_LOG`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Configuration with short timeouts that drives [`FAKE_REPL`].
pub fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        boot_timeout: Duration::from_secs(5),
        eval_timeout: Duration::from_secs(3),
        idle_timeout: Duration::from_secs(60),
        idle_check_interval: Duration::from_secs(60),
        kill_grace: Duration::from_millis(300),
        poll_interval: Duration::from_millis(20),
        prompt: PROMPT.to_string(),
        valid_keys: ["fast", "slow", "mute", "dead"]
            .into_iter()
            .map(String::from)
            .collect(),
        default_key: "fast".to_string(),
        launch: LaunchCommand::new("/bin/sh", ["-c", FAKE_REPL, "{key}"])
            .with_working_dir(std::env::temp_dir()),
    }
}

/// Registry over [`test_config`].
pub fn test_registry() -> Arc<Registry> {
    init_logging();
    Registry::new(test_config()).unwrap()
}

/// Registry over a tweaked [`test_config`].
pub fn test_registry_with(tweak: impl FnOnce(&mut SupervisorConfig)) -> Arc<Registry> {
    init_logging();
    let mut config = test_config();
    tweak(&mut config);
    Registry::new(config).unwrap()
}

/// Parse a key known to be valid for [`test_config`].
pub fn key(registry: &Registry, raw: &str) -> InstanceKey {
    registry.parse_key(raw).unwrap()
}

/// Whether a process with `pid` still exists (zombies excluded once reaped).
pub fn process_exists(pid: u32) -> bool {
    let Some(pid) = i32::try_from(pid).ok().and_then(rustix::process::Pid::from_raw) else {
        return false;
    };
    rustix::process::test_kill_process(pid).is_ok()
}

/// Poll `cond` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

//! Tool handler backed by a [`Registry`].

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use vmrepl::{InstanceKey, Registry, SessionInfo};

use crate::mcp::tools::all_tools;
use crate::mcp::{ToolDefinition, ToolHandler, ToolResult};

pub const RESTART_OK: &str = "Instance restarted successfully. Ready for input.";

#[derive(Debug, Deserialize)]
struct EvalArgs {
    code: String,
    #[serde(default)]
    arch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ArchArgs {
    #[serde(default)]
    arch: Option<String>,
}

/// Exposes `eval`, `restart` and `status` over one shared registry.
pub struct SupervisorTools {
    registry: Arc<Registry>,
}

impl SupervisorTools {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    fn resolve_key(&self, arch: Option<&str>) -> Result<InstanceKey, ToolResult> {
        let raw = arch.unwrap_or(&self.registry.config().default_key);
        self.registry
            .parse_key(raw)
            .map_err(|e| ToolResult::error(e.to_string()))
    }

    /// `[<key> | started YYYY-MM-DD HH:MM:SS]` or `[<key> | not started]`.
    fn header(&self, key: &InstanceKey) -> String {
        format_header(key, self.registry.started_at(key))
    }

    fn with_header(&self, key: &InstanceKey, body: &str) -> String {
        format!("{}\n\n{}", self.header(key), body)
    }

    async fn eval(&self, arguments: Value) -> ToolResult {
        let args: EvalArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => return ToolResult::error(format!("Invalid arguments: {e}")),
        };
        let key = match self.resolve_key(args.arch.as_deref()) {
            Ok(key) => key,
            Err(result) => return result,
        };

        debug!(key = %key, code = %args.code, "eval");
        match self.registry.evaluate(key.as_str(), &args.code).await {
            Ok(output) => ToolResult::text(self.with_header(&key, &output)),
            Err(e) => ToolResult::error(self.with_header(&key, &format!("Error: {e}"))),
        }
    }

    async fn restart(&self, arguments: Value) -> ToolResult {
        let args: ArchArgs = serde_json::from_value(arguments).unwrap_or_default();
        let key = match self.resolve_key(args.arch.as_deref()) {
            Ok(key) => key,
            Err(result) => return result,
        };

        info!(key = %key, "restart requested");
        match self.registry.restart(key.as_str()).await {
            Ok(_) => ToolResult::text(self.with_header(&key, RESTART_OK)),
            Err(e) => {
                ToolResult::error(self.with_header(&key, &format!("Error during restart: {e}")))
            }
        }
    }

    fn status(&self, arguments: Value) -> ToolResult {
        let args: ArchArgs = serde_json::from_value(arguments).unwrap_or_default();
        let infos: Vec<SessionInfo> = match args.arch.as_deref() {
            Some(arch) => {
                let key = match self.resolve_key(Some(arch)) {
                    Ok(key) => key,
                    Err(result) => return result,
                };
                self.registry
                    .snapshot()
                    .into_iter()
                    .filter(|info| info.key == key)
                    .collect()
            }
            None => self.registry.snapshot(),
        };

        let lines: Vec<String> = infos.iter().map(format_status_line).collect();
        ToolResult::text(lines.join("\n"))
    }
}

pub fn format_header(key: &InstanceKey, started_at: Option<chrono::DateTime<chrono::Local>>) -> String {
    match started_at {
        Some(ts) => format!("[{} | started {}]", key, ts.format("%Y-%m-%d %H:%M:%S")),
        None => format!("[{} | not started]", key),
    }
}

fn format_status_line(info: &SessionInfo) -> String {
    let header = format_header(&info.key, info.started_at);
    if info.running {
        format!("{} running ({}, idle {}s)", header, info.state, info.idle_secs)
    } else {
        format!("{} stopped", header)
    }
}

#[async_trait::async_trait]
impl ToolHandler for SupervisorTools {
    fn tools(&self) -> Vec<ToolDefinition> {
        let keys: Vec<&str> = self.registry.valid_keys().collect();
        all_tools(&keys, &self.registry.config().default_key)
    }

    async fn call(&self, name: &str, arguments: Value) -> ToolResult {
        match name {
            "eval" => self.eval(arguments).await,
            "restart" => self.restart(arguments).await,
            "status" => self.status(arguments),
            other => ToolResult::error(format!("Unknown tool: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::tools::ToolContent;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;
    use vmrepl::{LaunchCommand, SupervisorConfig};

    const SCRIPT: &str = r#"printf 'lona> '
while IFS= read -r line; do
  printf '%s\n' "$line"
  case "$line" in
    hang) sleep 600 ;;
    *) echo "$(($line))" ;;
  esac
  printf 'lona> '
done"#;

    fn body(result: &ToolResult) -> String {
        result
            .content
            .iter()
            .map(|ToolContent::Text { text }| text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn tools() -> SupervisorTools {
        let config = SupervisorConfig {
            eval_timeout: Duration::from_millis(500),
            kill_grace: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
            launch: LaunchCommand::new("/bin/sh", ["-c", SCRIPT]).with_working_dir("/tmp"),
            ..SupervisorConfig::default()
        };
        SupervisorTools::new(Registry::new(config).unwrap())
    }

    #[test]
    fn test_header_format() {
        let key = InstanceKey::parse("aarch64", &SupervisorConfig::default().valid_keys).unwrap();
        assert_eq!(format_header(&key, None), "[aarch64 | not started]");

        let ts = chrono::Local.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            format_header(&key, Some(ts)),
            "[aarch64 | started 2026-01-02 03:04:05]"
        );
    }

    #[tokio::test]
    async fn test_eval_uses_default_key_and_adds_header() {
        let tools = tools();
        let result = tools.call("eval", json!({ "code": "2 + 2" })).await;
        assert!(result.is_error.is_none());

        let body = body(&result);
        let (header, output) = body.split_once("\n\n").unwrap();
        assert!(header.starts_with("[aarch64 | started "), "{header}");
        assert_eq!(output, "4");
    }

    #[tokio::test]
    async fn test_eval_normalizes_arch() {
        let tools = tools();
        let result = tools
            .call("eval", json!({ "code": "1 + 1", "arch": "  X86_64 " }))
            .await;
        assert!(body(&result).starts_with("[x86_64 | started "));
        assert!(body(&result).ends_with("\n\n2"));
    }

    #[tokio::test]
    async fn test_invalid_arch_names_valid_set() {
        let tools = tools();
        let result = tools
            .call("eval", json!({ "code": "1", "arch": "riscv" }))
            .await;
        assert_eq!(result.is_error, Some(true));
        assert!(body(&result).contains("Valid: aarch64, x86_64"));
        assert!(!tools.registry.is_running(&tools.registry.parse_key("aarch64").unwrap()));
    }

    #[tokio::test]
    async fn test_eval_error_is_reported_under_header() {
        let tools = tools();
        let result = tools.call("eval", json!({ "code": "hang" })).await;
        assert_eq!(result.is_error, Some(true));
        let body = body(&result);
        assert!(body.starts_with("[aarch64 | not started]\n\nError: "), "{body}");
        assert!(body.contains("timeout waiting for response"));
    }

    #[tokio::test]
    async fn test_restart_and_status() {
        let tools = tools();

        let status = body(&tools.call("status", json!({})).await);
        assert_eq!(
            status,
            "[aarch64 | not started] stopped\n[x86_64 | not started] stopped"
        );

        let result = tools.call("restart", json!({ "arch": "x86_64" })).await;
        assert!(body(&result).ends_with(RESTART_OK));

        let status = body(&tools.call("status", json!({ "arch": "x86_64" })).await);
        assert!(status.starts_with("[x86_64 | started "), "{status}");
        assert!(status.contains("running (ready"));
        assert!(!tools.registry.is_running(&tools.registry.parse_key("aarch64").unwrap()));
    }

    #[tokio::test]
    async fn test_missing_code_is_rejected() {
        let tools = tools();
        let result = tools.call("eval", json!({})).await;
        assert_eq!(result.is_error, Some(true));
        assert!(body(&result).starts_with("Invalid arguments"));
    }
}

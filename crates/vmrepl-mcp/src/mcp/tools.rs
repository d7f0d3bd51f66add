//! MCP tool definitions and result types.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Tool definition following the MCP schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        ToolDefinition {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Tool result content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

/// Tool call result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        ToolResult {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: None,
        }
    }

    /// A text result flagged as a tool-level error.
    pub fn error(text: impl Into<String>) -> Self {
        ToolResult {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: Some(true),
        }
    }
}

fn arch_property(valid_keys: &[&str], default_key: &str) -> Value {
    json!({
        "type": "string",
        "description": format!(
            "Target instance ({}; default: {})",
            valid_keys.join(", "),
            default_key
        ),
    })
}

/// All tool definitions for the given key set.
pub fn all_tools(valid_keys: &[&str], default_key: &str) -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "eval",
            "Evaluate one expression in the REPL. The instance boots automatically on \
             first use. The result carries a header with the instance and its start time.",
            json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "Expression to evaluate (one line)"
                    },
                    "arch": arch_property(valid_keys, default_key)
                },
                "required": ["code"]
            }),
        ),
        ToolDefinition::new(
            "restart",
            "Kill the running instance, if any, and boot a fresh one. Use after \
             rebuilding to pick up code changes.",
            json!({
                "type": "object",
                "properties": {
                    "arch": arch_property(valid_keys, default_key)
                }
            }),
        ),
        ToolDefinition::new(
            "status",
            "Report whether instances are running and when they were started. \
             Never boots anything.",
            json!({
                "type": "object",
                "properties": {
                    "arch": arch_property(valid_keys, default_key)
                }
            }),
        ),
    ]
}

pub fn get_tool<'a>(tools: &'a [ToolDefinition], name: &str) -> Option<&'a ToolDefinition> {
    tools.iter().find(|t| t.name == name)
}

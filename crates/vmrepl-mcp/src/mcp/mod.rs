//! Model Context Protocol (JSON-RPC 2.0 over stdio).

pub mod protocol;
pub mod server;
pub mod tools;

pub use server::{McpServer, ServerInfo, ToolHandler};
pub use tools::{ToolDefinition, ToolResult};

//! MCP server over line-delimited stdio.
//!
//! `tools/call` requests run as separate tasks so that a long evaluation on
//! one instance does not hold up calls for other instances or status queries.
//! Responses are written in completion order; clients match them by id.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{self, Request, RequestId, Response, RpcError};
use super::tools::{ToolDefinition, ToolResult, get_tool};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Implemented by whatever backs the tools.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    /// Tools exposed by this handler.
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Handle a tool call. Failures are reported inside the result.
    async fn call(&self, name: &str, arguments: Value) -> ToolResult;
}

/// Identity reported in the `initialize` response.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub instructions: String,
}

pub struct McpServer<H: ToolHandler> {
    handler: Arc<H>,
    info: ServerInfo,
    initialized: bool,
}

impl<H: ToolHandler> McpServer<H> {
    pub fn new(handler: Arc<H>, info: ServerInfo) -> Self {
        McpServer {
            handler,
            info,
            initialized: false,
        }
    }

    /// Serve stdin/stdout until EOF or `shutdown` resolves.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Starting MCP server on stdio");
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), shutdown)
            .await
    }

    /// Serve one JSON-RPC message per line from `reader`, writing responses
    /// to `writer`. On EOF, in-flight tool calls are answered before
    /// returning; on `shutdown` they are abandoned.
    pub async fn serve<R, W>(
        &mut self,
        reader: R,
        mut writer: W,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
        let mut lines = reader.lines();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("EOF received, shutting down");
                        break;
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!("Received: {}", line);
                    if let Some(response) = self.handle_message(line, &tx) {
                        write_response(&mut writer, &response).await?;
                    }
                }
                Some(response) = rx.recv() => {
                    write_response(&mut writer, &response).await?;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested, leaving MCP loop");
                    return Ok(());
                }
            }
        }

        drop(tx);
        while let Some(response) = rx.recv().await {
            write_response(&mut writer, &response).await?;
        }
        Ok(())
    }

    /// Handle one line. Returns an immediate response, or `None` for
    /// notifications and for tool calls answered later through `tx`.
    fn handle_message(&mut self, message: &str, tx: &mpsc::UnboundedSender<Response>) -> Option<Response> {
        match protocol::parse_request_str(message) {
            Ok(request) => self.handle_request(request, tx),
            Err(err) => {
                warn!("Rejecting message: {}", err);
                Some(Response::from_error(RequestId::Null, err))
            }
        }
    }

    fn handle_request(&mut self, request: Request, tx: &mpsc::UnboundedSender<Response>) -> Option<Response> {
        let Request {
            method, params, id, ..
        } = request;

        let Some(id) = id else {
            match method.as_str() {
                "notifications/initialized" => debug!("Client initialized"),
                other => debug!("Ignoring notification: {}", other),
            }
            return None;
        };
        let params = params.unwrap_or(Value::Null);
        if !self.initialized && method.starts_with("tools/") {
            debug!("'{}' received before initialize", method);
        }

        match method.as_str() {
            "initialize" => Some(self.handle_initialize(id)),
            "ping" => Some(Response::success(id, json!({}))),
            "tools/list" => Some(self.handle_tools_list(id)),
            "tools/call" => {
                let handler = Arc::clone(&self.handler);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = handle_tools_call(handler.as_ref(), id, params).await;
                    let _ = tx.send(response);
                });
                None
            }
            _ => {
                warn!("Unknown method: {}", method);
                Some(Response::from_error(id, RpcError::MethodNotFound(method)))
            }
        }
    }

    fn handle_initialize(&mut self, id: RequestId) -> Response {
        self.initialized = true;
        info!("MCP server initialized");

        Response::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {},
                },
                "serverInfo": {
                    "name": self.info.name,
                    "version": self.info.version,
                },
                "instructions": self.info.instructions,
            }),
        )
    }

    fn handle_tools_list(&self, id: RequestId) -> Response {
        let tools = self.handler.tools();
        Response::success(id, json!({ "tools": tools }))
    }
}

async fn handle_tools_call<H: ToolHandler>(handler: &H, id: RequestId, params: Value) -> Response {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return Response::from_error(id, RpcError::InvalidParams("Missing 'name' field".to_string()));
    };

    if get_tool(&handler.tools(), name).is_none() {
        return Response::from_error(id, RpcError::InvalidParams(format!("Unknown tool: {}", name)));
    }

    let arguments = params
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

    debug!("Calling tool: {} with args: {}", name, arguments);
    let result = handler.call(name, arguments).await;

    match serde_json::to_value(result) {
        Ok(value) => Response::success(id, value),
        Err(e) => Response::from_error(id, RpcError::InternalError(e.to_string())),
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    let response_json = protocol::serialize_response_string(response)?;
    debug!("Sending: {}", response_json);
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

//! Line-delimited JSON-RPC 2.0 server over stdio.
//!
//! The MCP boundary: one request per line on stdin, one response per line
//! on stdout. Diagnostics never touch stdout; the protocol stream must
//! stay clean, so everything else goes to stderr via tracing.

use crate::error::Result;
use crate::tools::{tool_definitions, ToolHandler};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, trace};

/// MCP protocol revision this server speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// The stdio MCP server.
pub struct McpServer {
    tools: ToolHandler,
}

impl McpServer {
    #[must_use]
    pub fn new(tools: ToolHandler) -> Self {
        Self { tools }
    }

    /// Serve requests from stdin until EOF.
    ///
    /// # Errors
    ///
    /// Returns an error when stdio itself fails; per-request failures are
    /// answered in-band.
    pub async fn run(&self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut lines = stdin.lines();

        info!("memory server ready on stdio");
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(&line).await {
                stdout.write_all(response.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
        info!("stdin closed, shutting down");
        Ok(())
    }

    /// Handle one raw line; `None` for notifications.
    async fn handle_line(&self, line: &str) -> Option<String> {
        let request: Request = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, "unparseable request line");
                return Some(error_response(Value::Null, PARSE_ERROR, "Parse error").to_string());
            }
        };

        trace!(method = %request.method, id = ?request.id, "request");
        let is_notification = request.id.is_none();
        let outcome = self.handle_request(&request).await;

        if is_notification {
            if let Err((code, message)) = outcome {
                debug!(method = %request.method, code, %message, "notification failed");
            }
            return None;
        }

        let id = request.id.unwrap_or(Value::Null);
        let response = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => error_response(id, code, &message),
        };
        Some(response.to_string())
    }

    async fn handle_request(&self, request: &Request) -> std::result::Result<Value, (i64, String)> {
        match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "memvault",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "instructions": "You have access to a persistent memory system that \
                    remembers information between conversations. Check your memory at \
                    the start of a session by calling load_contexts, and save important \
                    information with save_context.",
            })),

            // Acknowledged silently; the client needs no response.
            "notifications/initialized" => Ok(Value::Null),

            "ping" => Ok(json!({})),

            "tools/list" => Ok(json!({"tools": tool_definitions()})),

            "tools/call" => {
                let name = request
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or((INVALID_PARAMS, "missing tool name".to_string()))?;
                let default_args = json!({});
                let arguments = request.params.get("arguments").unwrap_or(&default_args);

                self.tools.dispatch(name, arguments).await.map_err(|e| {
                    error!(tool = name, error = %e, "tool call failed");
                    (INTERNAL_ERROR, e.to_string())
                })
            }

            other => Err((METHOD_NOT_FOUND, format!("Unknown method: {other}"))),
        }
    }
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

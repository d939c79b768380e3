// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Tool protocol transports.
//!
//! Both transports speak JSON-RPC 2.0 and expose the same [`Transport`]
//! interface: protocol handshake, tool discovery, tool invocation, shutdown.
//! The stdio transport frames requests as newline-delimited JSON over a
//! subprocess; the event-stream transport POSTs requests to a companion URL
//! discovered from the server's initial `endpoint` event and reads responses
//! from `message` events.

pub mod sse;
pub mod stdio;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::constants::PROTOCOL_VERSION;
use crate::error::{Error, Result};

/// A JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Request id; absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// A request expecting a response.
    #[must_use]
    pub fn new(method: impl Into<String>, id: i64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.into(),
            params: None,
        }
    }

    /// A notification (no id, no response expected).
    #[must_use]
    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    /// Attach parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Matches the request id.
    #[serde(default)]
    pub id: Option<i64>,
    /// Result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Extra data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A tool as advertised by a server's `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredTool {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for arguments.
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: Value,
    /// JSON Schema for results, when advertised.
    #[serde(default, rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

fn default_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// One content item in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Content type, `"text"` for everything this core consumes.
    #[serde(rename = "type")]
    pub kind: String,
    /// Text payload.
    #[serde(default)]
    pub text: String,
}

/// The outcome of a `tools/call`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Result content items.
    #[serde(default)]
    pub content: Vec<ContentItem>,
    /// Whether the tool reported failure.
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolOutcome {
    /// Concatenated text of all content items.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|item| item.kind == "text")
            .map(|item| item.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// A single-text success outcome.
    #[must_use]
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem {
                kind: "text".to_string(),
                text: text.into(),
            }],
            is_error: false,
        }
    }

    /// A single-text error outcome.
    #[must_use]
    pub fn err(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::ok(text)
        }
    }
}

/// The common transport interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the protocol handshake.
    async fn initialize(&self) -> Result<()>;

    /// Discover the server's tools.
    async fn list_tools(&self) -> Result<Vec<DiscoveredTool>>;

    /// Invoke a tool, waiting up to `timeout` for the response.
    async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<ToolOutcome>;

    /// Release resources. Pending requests fail with a cancellation error.
    async fn close(&self) -> Result<()>;

    /// Server name this transport is bound to.
    fn server_name(&self) -> &str;
}

/// Parameters for the `initialize` handshake.
#[must_use]
pub(crate) fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {"tools": {}},
        "clientInfo": {
            "name": "dashagent",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Decode a `tools/list` result payload.
pub(crate) fn parse_tools_result(server: &str, result: Option<Value>) -> Result<Vec<DiscoveredTool>> {
    #[derive(Deserialize)]
    struct ToolsResult {
        #[serde(default)]
        tools: Vec<DiscoveredTool>,
    }

    match result {
        Some(result) => {
            let parsed: ToolsResult =
                serde_json::from_value(result).map_err(|e| Error::Protocol {
                    server: server.to_string(),
                    reason: format!("malformed tools/list result: {e}"),
                })?;
            Ok(parsed.tools)
        }
        None => Ok(Vec::new()),
    }
}

/// Decode a `tools/call` result payload.
pub(crate) fn parse_call_result(server: &str, result: Option<Value>) -> Result<ToolOutcome> {
    match result {
        Some(result) => serde_json::from_value(result).map_err(|e| Error::Protocol {
            server: server.to_string(),
            reason: format!("malformed tools/call result: {e}"),
        }),
        None => Ok(ToolOutcome::err("no result returned")),
    }
}

/// Map a JSON-RPC error object into the core error for a tool call.
pub(crate) fn rpc_error_to_tool_error(
    server: &str,
    tool: &str,
    attempt: u32,
    error: &JsonRpcError,
) -> Error {
    Error::ToolExecution {
        server: server.to_string(),
        tool: tool.to_string(),
        attempt,
        reason: format!("server error {}: {}", error.code, error.message),
    }
}

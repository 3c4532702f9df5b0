//! Tool-server wire protocol.
//!
//! JSON-RPC 2.0, one message per line, over the tool server's stdin/stdout.
//! Three methods matter: `initialize`, `tools/list` and `tools/call`.
//! Tool payloads travel as text content blocks holding a JSON document.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub mod client;
pub mod server;

pub use client::{ClientState, ToolCallOutcome, ToolClient, ToolInvoker, ToolServerConfig};
pub use server::ToolServer;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    pub fn call(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(json!(id)),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// A request after method dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Initialize,
    ListTools,
    CallTool(CallToolParams),
    Ping,
    /// Anything without an id. Never answered.
    Notification(String),
}

impl Request {
    pub fn from_wire(request: &RpcRequest) -> Result<Self, RpcError> {
        if request.id.is_none() {
            return Ok(Request::Notification(request.method.clone()));
        }
        match request.method.as_str() {
            "initialize" => Ok(Request::Initialize),
            "tools/list" => Ok(Request::ListTools),
            "ping" => Ok(Request::Ping),
            "tools/call" => serde_json::from_value(request.params.clone())
                .map(Request::CallTool)
                .map_err(|e| RpcError {
                    code: INVALID_PARAMS,
                    message: format!("invalid tools/call params: {}", e),
                }),
            other => Err(RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("Method not found: {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Value,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// One entry of a `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Every shipped tool takes the raw user query.
pub fn query_input_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "The customer's question or the text the tool should work on"
            }
        },
        "required": ["query"]
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl CallToolParams {
    /// The `query` argument. A bare string is accepted as the query itself.
    pub fn query(&self) -> Option<&str> {
        match &self.arguments {
            Value::String(s) => Some(s.as_str()),
            other => other.get("query").and_then(Value::as_str),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>, is_error: bool) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error,
        }
    }

    /// `{"success": false, "error": ...}` wrapped as an error result.
    pub fn error_envelope(error: impl Into<String>) -> Self {
        let body = json!({ "success": false, "error": error.into() });
        Self::text(body.to_string(), true)
    }

    /// All text blocks joined, in order.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|ContentBlock::Text { text }| text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

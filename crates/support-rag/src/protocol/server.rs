//! Tool server: answers protocol requests from a `ToolRegistry`.
//!
//! Requests are handled concurrently. Responses funnel through one writer
//! task, so lines never interleave. A tool that errors or panics is reported
//! to the caller as an error envelope and the server keeps serving.

use anyhow::{Context, Result};
use futures::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};

use super::{
    query_input_schema, CallToolParams, CallToolResult, InitializeResult, ListToolsResult,
    Request, RpcRequest, RpcResponse, ServerInfo, ToolSpec, PARSE_ERROR, PROTOCOL_VERSION,
};
use crate::tools::ToolRegistry;

/// Requests handled at once. Reading pauses while all slots are busy.
pub const DEFAULT_MAX_CONCURRENT: usize = 32;

pub struct ToolServer {
    registry: Arc<ToolRegistry>,
    info: ServerInfo,
    limiter: Arc<Semaphore>,
}

impl ToolServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            info: ServerInfo {
                name: "support-tools-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            limiter: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
        }
    }

    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Catalog in registration order.
    pub fn list_tools(&self) -> Vec<ToolSpec> {
        self.registry
            .list()
            .iter()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: query_input_schema(),
            })
            .collect()
    }

    pub async fn call_tool(&self, params: CallToolParams) -> CallToolResult {
        let Some(tool) = self.registry.get(&params.name) else {
            tracing::warn!(tool = %params.name, "Call for unknown tool");
            return CallToolResult::error_envelope(format!("tool '{}' not found", params.name));
        };
        let Some(query) = params.query() else {
            return CallToolResult::error_envelope("missing 'query' argument");
        };

        let started = std::time::Instant::now();
        let outcome = AssertUnwindSafe(tool.execute(query)).catch_unwind().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                tracing::info!(tool = %params.name, success = output.success, elapsed_ms, "Tool executed");
                match serde_json::to_string(&output) {
                    Ok(text) => CallToolResult::text(text, !output.success),
                    Err(e) => CallToolResult::error_envelope(format!("unserializable output: {}", e)),
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(tool = %params.name, error = %e, elapsed_ms, "Tool failed");
                CallToolResult::error_envelope(e.to_string())
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(tool = %params.name, panic = %message, "Tool panicked");
                CallToolResult::error_envelope(format!("tool '{}' panicked: {}", params.name, message))
            }
        }
    }

    /// `None` for notifications.
    pub async fn handle(&self, request: RpcRequest) -> Option<RpcResponse> {
        let id = request.id.clone().unwrap_or(Value::Null);
        let dispatched = match Request::from_wire(&request) {
            Ok(dispatched) => dispatched,
            Err(e) => return Some(RpcResponse::err(id, e.code, e.message)),
        };

        let result = match dispatched {
            Request::Notification(method) => {
                tracing::debug!(%method, "Notification received");
                return None;
            }
            Request::Initialize => serde_json::to_value(InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: json!({ "tools": {} }),
                server_info: self.info.clone(),
            }),
            Request::Ping => Ok(json!({})),
            Request::ListTools => serde_json::to_value(ListToolsResult {
                tools: self.list_tools(),
            }),
            Request::CallTool(params) => serde_json::to_value(self.call_tool(params).await),
        };

        Some(match result {
            Ok(value) => RpcResponse::ok(id, value),
            Err(e) => RpcResponse::err(id, super::INVALID_REQUEST, e.to_string()),
        })
    }

    /// Serve until the reader reaches EOF. Requests still running at EOF are
    /// answered before this returns.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<RpcResponse>();
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read request line")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let request: RpcRequest = match serde_json::from_str(line) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(error = %e, "Unparseable request line");
                    let _ = tx.send(RpcResponse::err(Value::Null, PARSE_ERROR, "Parse error"));
                    continue;
                }
            };

            let permit = Arc::clone(&self.limiter)
                .acquire_owned()
                .await
                .context("Request limiter closed")?;
            let server = Arc::clone(&self);
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle(request).await {
                    let _ = tx.send(response);
                }
                drop(permit);
            });
        }

        tracing::info!("Request stream closed, draining responses");
        drop(tx);
        writer_task.await.context("Response writer task failed")??;
        Ok(())
    }

    pub async fn serve_stdio(self: Arc<Self>) -> Result<()> {
        tracing::info!(tools = self.registry.len(), "Tool server ready on stdio");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<RpcResponse>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write response")?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CalculatorTool, SupportTool, ToolOutput};
    use async_trait::async_trait;

    struct PanickingTool;

    #[async_trait]
    impl SupportTool for PanickingTool {
        fn name(&self) -> &str {
            "exploder"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn should_use(&self, _query: &str) -> bool {
            false
        }
        async fn execute(&self, _query: &str) -> anyhow::Result<ToolOutput> {
            panic!("boom")
        }
    }

    /// Sleeps briefly and records the highest number of overlapping calls.
    #[derive(Default)]
    struct Overlap {
        running: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    struct OverlapTool(Arc<Overlap>);

    #[async_trait]
    impl SupportTool for OverlapTool {
        fn name(&self) -> &str {
            "overlap"
        }
        fn description(&self) -> &str {
            "tracks concurrency"
        }
        fn should_use(&self, _query: &str) -> bool {
            false
        }
        async fn execute(&self, query: &str) -> anyhow::Result<ToolOutput> {
            use std::sync::atomic::Ordering;
            let now = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.0.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ToolOutput::success(1.0, query, json!({})))
        }
    }

    fn server() -> ToolServer {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculatorTool::new()));
        registry.register(Arc::new(PanickingTool));
        ToolServer::new(registry)
    }

    fn params(name: &str, query: &str) -> CallToolParams {
        CallToolParams {
            name: name.into(),
            arguments: json!({ "query": query }),
        }
    }

    fn envelope(result: &CallToolResult) -> Value {
        serde_json::from_str(&result.joined_text()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_tool_envelope() {
        let result = server().call_tool(params("weather", "rain?")).await;
        assert!(result.is_error);
        let body = envelope(&result);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_panic_becomes_envelope() {
        let server = server();
        let result = server.call_tool(params("exploder", "x")).await;
        assert!(result.is_error);
        assert!(envelope(&result)["error"].as_str().unwrap().contains("boom"));

        let result = server.call_tool(params("calculator", "calculate 2 + 3")).await;
        assert!(!result.is_error);
        assert_eq!(envelope(&result)["success"], true);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let request: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(server().handle(request).await.is_none());
    }

    #[tokio::test]
    async fn test_serve_over_duplex() {
        let (client, server_io) = tokio::io::duplex(16 * 1024);
        let (read_half, write_half) = tokio::io::split(server_io);
        let handle = tokio::spawn(Arc::new(server()).serve(read_half, write_half));

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"not json\n{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"tools/list\"}\n")
            .await
            .unwrap();
        client_write.shutdown().await.unwrap();
        drop(client_write);

        let mut lines = BufReader::new(client_read).lines();
        let mut responses = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(serde_json::from_str::<RpcResponse>(&line).unwrap());
        }
        handle.await.unwrap().unwrap();

        assert_eq!(responses.len(), 2);
        let parse_error = responses.iter().find(|r| r.id.is_null()).unwrap();
        assert_eq!(parse_error.error.as_ref().unwrap().code, PARSE_ERROR);
        let listed = responses.iter().find(|r| r.id == json!(7)).unwrap();
        let names: Vec<&str> = listed.result.as_ref().unwrap()["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["calculator", "exploder"]);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_capped() {
        let overlap = Arc::new(Overlap::default());
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(OverlapTool(Arc::clone(&overlap))));
        let server = Arc::new(ToolServer::new(registry).with_max_concurrent(2));

        let (client, server_io) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(server_io);
        let handle = tokio::spawn(server.serve(read_half, write_half));

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut batch = String::new();
        for id in 1..=6 {
            batch.push_str(&format!(
                "{{\"jsonrpc\":\"2.0\",\"id\":{},\"method\":\"tools/call\",\"params\":{{\"name\":\"overlap\",\"arguments\":{{\"query\":\"q\"}}}}}}\n",
                id
            ));
        }
        client_write.write_all(batch.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();
        drop(client_write);

        let mut lines = BufReader::new(client_read).lines();
        let mut answered = 0;
        while let Some(line) = lines.next_line().await.unwrap() {
            let response: RpcResponse = serde_json::from_str(&line).unwrap();
            assert!(response.error.is_none());
            answered += 1;
        }
        handle.await.unwrap().unwrap();

        assert_eq!(answered, 6);
        assert_eq!(overlap.peak.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}

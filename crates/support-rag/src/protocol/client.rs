//! Client side of the tool-server connection.
//!
//! One `ToolClient` owns one server process. Requests are multiplexed by id:
//! a reader task routes each response line to the oneshot channel of the
//! request that is waiting for it.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{CallToolResult, InitializeResult, ListToolsResult, RpcRequest, RpcResponse, ToolSpec, PROTOCOL_VERSION};
use crate::config::ToolServerSettings;

pub const BUNDLED_SERVER_NAME: &str = "support-tools-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Uninitialized,
    Connecting,
    Ready,
    /// Ready with at least one call in flight.
    Calling,
    Closed,
}

/// How to launch the tool server.
#[derive(Debug, Clone)]
pub struct ToolServerConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ToolServerConfig {
    /// The server binary shipped next to the running executable.
    pub fn bundled() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        let dir = exe
            .parent()
            .ok_or_else(|| anyhow!("Executable has no parent directory"))?;
        Ok(Self {
            command: dir.join(format!("{}{}", BUNDLED_SERVER_NAME, std::env::consts::EXE_SUFFIX)),
            args: Vec::new(),
            env: HashMap::new(),
        })
    }

    pub fn from_settings(settings: &ToolServerSettings) -> Result<Self> {
        let mut config = match &settings.command {
            Some(command) => Self {
                command: PathBuf::from(command),
                args: Vec::new(),
                env: HashMap::new(),
            },
            None => Self::bundled()?,
        };
        config.args = settings.args.clone();
        config.env = settings.env.clone();
        Ok(config)
    }
}

/// What the caller sees for one tool call. Never an `Err`: every failure mode
/// (not connected, timeout, tool error, garbled payload) lands in `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ToolCallOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Interpret a `tools/call` result. The text payload is parsed as JSON
    /// when possible and wrapped as `{"text": ...}` otherwise.
    pub fn from_call_result(result: &CallToolResult) -> Self {
        let text = result.joined_text();
        let payload = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| json!({ "text": text }));

        if result.is_error {
            let error = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("tool reported an error")
                .to_string();
            Self {
                success: false,
                result: Some(payload),
                error: Some(error),
            }
        } else {
            Self {
                success: true,
                result: Some(payload),
                error: None,
            }
        }
    }
}

/// The seam the orchestrator calls tools through.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn call_tool(&self, name: &str, arguments: Value) -> ToolCallOutcome;
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// Counts a call as in flight until it finishes or its future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Removes the waiter for `id` once its request is over, answered or not.
struct Waiter<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct ToolClient {
    state: Arc<Mutex<ClientState>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: PendingMap,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    call_timeout: Duration,
    connect_timeout: Duration,
}

impl ToolClient {
    pub fn new(call_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClientState::Uninitialized)),
            writer: tokio::sync::Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            reader_task: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            call_timeout,
            connect_timeout,
        }
    }

    pub fn from_settings(settings: &ToolServerSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.call_timeout_secs()),
            Duration::from_secs(settings.connect_timeout_secs()),
        )
    }

    pub fn state(&self) -> ClientState {
        let state = *self.state.lock();
        if state == ClientState::Ready && self.in_flight.load(Ordering::SeqCst) > 0 {
            ClientState::Calling
        } else {
            state
        }
    }

    fn is_connected(&self) -> bool {
        *self.state.lock() == ClientState::Ready
    }

    /// Claim the connecting slot. Only an uninitialized client may connect.
    fn begin_connect(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ClientState::Uninitialized {
            *state = ClientState::Connecting;
            true
        } else {
            false
        }
    }

    /// Spawn the server process and run the handshake. Returns `false`
    /// instead of failing; the client can be retried after a failed attempt.
    pub async fn initialize(&self, config: &ToolServerConfig) -> bool {
        if self.is_connected() {
            return true;
        }
        if !self.begin_connect() {
            tracing::warn!(state = ?self.state(), "Tool client cannot connect from this state");
            return false;
        }

        tracing::info!(command = %config.command.display(), "🔌 Starting tool server");
        let mut child = match Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, command = %config.command.display(), "Failed to spawn tool server");
                *self.state.lock() = ClientState::Uninitialized;
                return false;
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            tracing::warn!("Tool server pipes unavailable");
            let _ = child.start_kill();
            *self.state.lock() = ClientState::Uninitialized;
            return false;
        };
        *self.child.lock().await = Some(child);

        let connected = self.handshake(stdout, stdin).await;
        if !connected {
            if let Some(mut child) = self.child.lock().await.take() {
                let _ = child.start_kill();
            }
        }
        connected
    }

    /// Run the handshake over an already-open transport.
    pub async fn connect_transport<R, W>(&self, reader: R, writer: W) -> bool
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if !self.begin_connect() {
            return false;
        }
        self.handshake(reader, writer).await
    }

    /// Caller has moved the state to `Connecting`.
    async fn handshake<R, W>(&self, reader: R, writer: W) -> bool
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        *self.writer.lock().await = Some(Box::new(writer));
        let reader_task = tokio::spawn(read_responses(
            reader,
            Arc::clone(&self.pending),
            Arc::clone(&self.state),
        ));
        *self.reader_task.lock() = Some(reader_task);

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "support-rag",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let handshake = async {
            let result = self.request("initialize", params, self.connect_timeout).await?;
            let info: InitializeResult =
                serde_json::from_value(result).context("Invalid initialize response")?;
            self.notify("notifications/initialized").await?;
            Ok::<_, anyhow::Error>(info)
        };

        match handshake.await {
            Ok(info) => {
                let mut state = self.state.lock();
                if *state != ClientState::Connecting {
                    return false;
                }
                *state = ClientState::Ready;
                tracing::info!(
                    server = %info.server_info.name,
                    version = %info.server_info.version,
                    protocol = %info.protocol_version,
                    "✅ Tool server connected"
                );
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Tool server handshake failed");
                self.teardown().await;
                *self.state.lock() = ClientState::Uninitialized;
                false
            }
        }
    }

    async fn write_line(&self, message: &RpcRequest) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Tool server connection is closed"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write to tool server")?;
        writer.flush().await.context("Failed to flush tool server stdin")?;
        Ok(())
    }

    async fn notify(&self, method: &str) -> Result<()> {
        self.write_line(&RpcRequest::notification(method)).await
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _waiter = Waiter {
            pending: &self.pending,
            id,
        };

        self.write_line(&RpcRequest::call(id, method, params)).await?;

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(anyhow!("Connection closed by tool server")),
            Err(_) => return Err(anyhow!("{} timed out after {:?}", method, timeout)),
        };

        if let Some(error) = response.error {
            return Err(anyhow!("{} failed ({}): {}", method, error.code, error.message));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        if !self.is_connected() {
            return Err(anyhow!("Tool client is not ready (state: {:?})", self.state()));
        }
        let result = self.request("tools/list", json!({}), self.call_timeout).await?;
        let listed: ListToolsResult = serde_json::from_value(result).context("Invalid tools/list response")?;
        Ok(listed.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolCallOutcome {
        if !self.is_connected() {
            return ToolCallOutcome::failed(format!(
                "Tool client is not ready (state: {:?})",
                self.state()
            ));
        }

        let in_flight = InFlight::enter(&self.in_flight);
        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                self.call_timeout,
            )
            .await;
        drop(in_flight);

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "Tool call failed");
                return ToolCallOutcome::failed(e.to_string());
            }
        };

        match serde_json::from_value::<CallToolResult>(value.clone()) {
            Ok(result) => ToolCallOutcome::from_call_result(&result),
            Err(_) => ToolCallOutcome {
                success: false,
                result: Some(json!({ "text": value.to_string() })),
                error: Some("Malformed tools/call result".to_string()),
            },
        }
    }

    async fn teardown(&self) {
        self.writer.lock().await.take();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.pending.lock().clear();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
    }

    /// Shut the connection down. A closed client stays closed.
    pub async fn close(&self) {
        *self.state.lock() = ClientState::Closed;
        self.teardown().await;
        tracing::info!("🔌 Tool server connection closed");
    }
}

impl Drop for ToolClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ToolInvoker for ToolClient {
    fn is_ready(&self) -> bool {
        self.is_connected()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> ToolCallOutcome {
        ToolClient::call_tool(self, name, arguments).await
    }
}

/// Route response lines to their waiting requests. On EOF the connection is
/// marked closed and every waiter is released with an error.
async fn read_responses<R>(reader: R, pending: PendingMap, state: Arc<Mutex<ClientState>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response: RpcResponse = match serde_json::from_str(line) {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(error = %e, "Ignoring unparseable line from tool server");
                        continue;
                    }
                };
                let Some(id) = response.id.as_u64() else {
                    tracing::warn!(id = %response.id, "Response without a request id");
                    continue;
                };
                match pending.lock().remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => tracing::debug!(id, "Response for a request nobody is waiting on"),
                }
            }
            Ok(None) => {
                tracing::warn!("Tool server closed its output");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from tool server");
                break;
            }
        }
    }

    {
        let mut state = state.lock();
        if *state == ClientState::Ready {
            *state = ClientState::Closed;
        }
    }
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolServer;
    use crate::tools::{CalculatorTool, DateTimeTool, SupportTool, ToolOutput, ToolRegistry};

    struct SlowEcho;

    #[async_trait]
    impl SupportTool for SlowEcho {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes after a delay"
        }
        fn should_use(&self, _query: &str) -> bool {
            false
        }
        async fn execute(&self, query: &str) -> Result<ToolOutput> {
            let delay: u64 = query.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(ToolOutput::success(1.0, query, json!({ "echo": query })))
        }
    }

    async fn connected() -> ToolClient {
        connected_with_timeout(Duration::from_secs(5)).await
    }

    async fn connected_with_timeout(call_timeout: Duration) -> ToolClient {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculatorTool::new()));
        registry.register(Arc::new(DateTimeTool::new()));
        registry.register(Arc::new(SlowEcho));

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        tokio::spawn(Arc::new(ToolServer::new(registry)).serve(server_read, server_write));

        let client = ToolClient::new(call_timeout, Duration::from_secs(5));
        let (client_read, client_write) = tokio::io::split(client_io);
        assert!(client.connect_transport(client_read, client_write).await);
        client
    }

    #[tokio::test]
    async fn test_list_tools_is_stable() {
        let client = connected().await;
        assert_eq!(client.state(), ClientState::Ready);

        let first = client.list_tools().await.unwrap();
        let second = client.list_tools().await.unwrap();
        let names: Vec<&str> = first.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["calculator", "datetime", "echo"]);
        assert_eq!(first, second);
        assert_eq!(first[0].input_schema["required"][0], "query");
    }

    #[tokio::test]
    async fn test_call_tool_success_and_not_found() {
        let client = connected().await;

        let outcome = client.call_tool("calculator", json!({ "query": "calculate 2 + 3" })).await;
        assert!(outcome.success, "{:?}", outcome);
        assert_eq!(outcome.result.as_ref().unwrap()["success"], true);

        let outcome = client.call_tool("weather", json!({ "query": "rain?" })).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not found"));
        assert_eq!(outcome.result.unwrap()["success"], false);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_routed_by_id() {
        let client = Arc::new(connected().await);
        let slow = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call_tool("echo", json!({ "query": "150" })).await })
        };
        let fast = client.call_tool("echo", json!({ "query": "0" })).await;
        let slow = slow.await.unwrap();

        assert_eq!(fast.result.unwrap()["data"]["echo"], "0");
        assert_eq!(slow.result.unwrap()["data"]["echo"], "150");
    }

    #[tokio::test]
    async fn test_slow_call_times_out_and_client_stays_ready() {
        let client = connected_with_timeout(Duration::from_millis(50)).await;

        let outcome = client.call_tool("echo", json!({ "query": "500" })).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert_eq!(client.state(), ClientState::Ready);
        assert!(client.pending.lock().is_empty());

        let outcome = client.call_tool("echo", json!({ "query": "0" })).await;
        assert!(outcome.success, "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_leak() {
        let client = connected().await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(30),
            client.call_tool("echo", json!({ "query": "300" })),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(client.state(), ClientState::Ready);
        assert!(client.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fails_fast_before_init_and_after_close() {
        let client = ToolClient::new(Duration::from_secs(5), Duration::from_secs(5));
        let outcome = client.call_tool("calculator", json!({ "query": "1+1" })).await;
        assert!(!outcome.success);
        assert!(client.list_tools().await.is_err());

        let client = connected().await;
        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);
        let outcome = client.call_tool("calculator", json!({ "query": "1+1" })).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("not ready"));
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_false() {
        let client = ToolClient::new(Duration::from_secs(1), Duration::from_secs(1));
        let config = ToolServerConfig {
            command: PathBuf::from("/definitely/not/a/tool-server"),
            args: Vec::new(),
            env: HashMap::new(),
        };
        assert!(!client.initialize(&config).await);
        assert_eq!(client.state(), ClientState::Uninitialized);
    }

    #[test]
    fn test_plain_text_payload_is_wrapped() {
        let outcome = ToolCallOutcome::from_call_result(&CallToolResult::text("all good", false));
        assert!(outcome.success);
        assert_eq!(outcome.result.unwrap(), json!({ "text": "all good" }));

        let outcome = ToolCallOutcome::from_call_result(&CallToolResult::text("kaput", true));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("tool reported an error"));
    }
}

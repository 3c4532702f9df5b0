//! Tool server: speaks line-delimited JSON-RPC on stdin/stdout.
//!
//! Started by the query process. Logs go to stderr because stdout carries
//! the protocol.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use support_rag::protocol::ToolServer;
use support_rag::tools::ToolRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("support_rag=info,support_tools_server=info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let registry = ToolRegistry::with_default_tools(reqwest::Client::new());
    tracing::info!(tools = ?registry.names(), "🚀 Tool server starting");

    let server = Arc::new(ToolServer::new(registry));
    if let Err(e) = server.serve_stdio().await {
        tracing::error!("Tool server stopped: {e:#}");
        std::process::exit(1);
    }
}

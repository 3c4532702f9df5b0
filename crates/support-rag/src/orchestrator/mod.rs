//! Tool orchestration: choose tools for a query, call them concurrently
//! through the tool server, merge what comes back.
//!
//! An `Orchestrator` is built from one enablement snapshot and never changes
//! afterwards. Configuration changes produce a new orchestrator.

use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

pub mod selection;
pub mod stats;

pub use selection::{
    render_catalog, CatalogEntry, FallbackSelector, LlmToolSelector, RuleBasedSelector, ToolSelection,
    ToolSelector,
};
pub use stats::{ToolUsage, ToolUsageStats, UsageSnapshot};

use crate::config::RoutingConfig;
use crate::error::SupportError;
use crate::protocol::{ToolCallOutcome, ToolInvoker};
use crate::tools::config::env_is_set;
use crate::tools::ToolConfigFile;
use crate::types::{OrchestratorResult, ToolFailure, ToolInvocationResult};

/// Answers whether a named secret is present.
pub type SecretCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct Orchestrator {
    invoker: Arc<dyn ToolInvoker>,
    selector: Arc<dyn ToolSelector>,
    config: Arc<ToolConfigFile>,
    routing: RoutingConfig,
    stats: Arc<ToolUsageStats>,
    secrets: SecretCheck,
}

impl Orchestrator {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        selector: Arc<dyn ToolSelector>,
        config: Arc<ToolConfigFile>,
        routing: RoutingConfig,
        stats: Arc<ToolUsageStats>,
    ) -> Self {
        Self {
            invoker,
            selector,
            config,
            routing,
            stats,
            secrets: Arc::new(env_is_set),
        }
    }

    /// Replace the process-environment lookup used to decide which tools
    /// have their secrets.
    pub fn with_secret_check(mut self, secrets: SecretCheck) -> Self {
        self.secrets = secrets;
        self
    }

    /// The enablement snapshot this orchestrator was built from.
    pub fn config(&self) -> &Arc<ToolConfigFile> {
        &self.config
    }

    /// Enabled tools whose declared secrets are all set.
    pub fn available_tools(&self) -> Vec<String> {
        self.config.available_tools(|key| (self.secrets)(key))
    }

    /// Available tools from the snapshot, optionally narrowed by the caller.
    /// A caller list can never re-enable a disabled tool.
    fn catalog(&self, enabled: Option<&[String]>) -> Vec<CatalogEntry> {
        self.config
            .tools
            .iter()
            .filter(|(_, descriptor)| descriptor.enabled)
            .filter(|(id, descriptor)| {
                let missing = descriptor.missing_secrets(|key| (self.secrets)(key));
                if !missing.is_empty() {
                    tracing::debug!(tool = %id, missing = ?missing, "Tool unavailable, secrets not set");
                }
                missing.is_empty()
            })
            .filter(|(id, _)| enabled.map_or(true, |list| list.iter().any(|e| e == *id)))
            .map(|(id, descriptor)| CatalogEntry::from_descriptor(id, descriptor))
            .collect()
    }

    pub async fn decide_tools(&self, query: &str, confidence: f32, enabled: Option<&[String]>) -> Vec<String> {
        let catalog = self.catalog(enabled);
        if catalog.is_empty() {
            tracing::info!("No enabled tools, skipping selection");
            return Vec::new();
        }

        let selection = match self.selector.select(query, confidence, &catalog).await {
            Ok(selection) => selection,
            Err(e) => {
                tracing::warn!(error = %e, "Tool selection failed");
                return Vec::new();
            }
        };

        let allowed: HashSet<&str> = catalog.iter().map(|e| e.id.as_str()).collect();
        let mut picked: Vec<String> = Vec::new();
        for tool in selection.tools {
            if !allowed.contains(tool.as_str()) {
                tracing::debug!(%tool, "Dropping tool outside the enabled set");
                continue;
            }
            if !picked.contains(&tool) {
                picked.push(tool);
            }
        }

        tracing::info!(tools = ?picked, reasoning = %selection.reasoning, "🎯 Tools selected");
        picked
    }

    /// Run the named tools concurrently. Individual failures end up in
    /// `errors`; only an unreachable tool server is an `Err`.
    pub async fn execute_tools(&self, names: &[String], query: &str) -> Result<OrchestratorResult, SupportError> {
        let default_confidence = self.routing.default_tool_confidence;
        let mut requested: Vec<String> = Vec::new();
        for name in names {
            if !requested.contains(name) {
                requested.push(name.clone());
            }
        }
        if requested.is_empty() {
            return Ok(OrchestratorResult::empty(default_confidence));
        }
        if !self.invoker.is_ready() {
            return Err(SupportError::ToolServerUnavailable(
                "tool server is not connected".to_string(),
            ));
        }

        self.stats.record_orchestration();
        tracing::info!(tools = ?requested, "🔧 Executing tools");

        let calls = requested.iter().map(|name| async move {
            let started = Instant::now();
            let outcome = self.invoker.call_tool(name, json!({ "query": query })).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            self.stats.record_call(name, outcome.success, latency_ms);
            (name.clone(), outcome)
        });
        let outcomes = join_all(calls).await;

        if outcomes.iter().all(|(_, o)| !o.success) && !self.invoker.is_ready() {
            return Err(SupportError::ToolServerUnavailable(
                "tool server connection lost during calls".to_string(),
            ));
        }

        let mut result = OrchestratorResult::empty(default_confidence);
        let mut successes: Vec<ToolInvocationResult> = Vec::new();
        let mut reported: Vec<f32> = Vec::new();
        for (name, outcome) in outcomes {
            match invocation_result(&name, outcome) {
                Ok((invocation, confidence)) => {
                    reported.extend(confidence);
                    successes.push(invocation);
                }
                Err(failure) => {
                    tracing::warn!(tool = %failure.tool_name, error = %failure.error, "Tool failed");
                    result.errors.push(failure);
                }
            }
        }

        result.overall_confidence = mean_or(&reported, default_confidence);
        result.combined_narrative = narrative(&successes, &result.errors);
        result.results = successes.into_iter().map(|r| (r.tool_name.clone(), r)).collect();
        result.tools_used = requested;

        tracing::info!(
            succeeded = result.results.len(),
            failed = result.errors.len(),
            confidence = result.overall_confidence,
            "Tool round complete"
        );
        Ok(result)
    }
}

/// A success plus the confidence the tool reported, if any.
fn invocation_result(
    name: &str,
    outcome: ToolCallOutcome,
) -> Result<(ToolInvocationResult, Option<f32>), ToolFailure> {
    if !outcome.success {
        return Err(ToolFailure {
            tool_name: name.to_string(),
            error: outcome.error.unwrap_or_else(|| "tool call failed".to_string()),
        });
    }

    let payload = outcome.result.unwrap_or(Value::Null);
    let confidence = payload
        .get("confidence")
        .and_then(Value::as_f64)
        .map(|c| (c as f32).clamp(0.0, 1.0));
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| payload.get("text").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    let invocation = ToolInvocationResult {
        tool_name: name.to_string(),
        success: true,
        confidence: confidence.unwrap_or(0.0),
        message,
        payload,
        error: None,
    };
    Ok((invocation, confidence))
}

fn mean_or(values: &[f32], default: f32) -> f32 {
    if values.is_empty() {
        default
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

fn narrative(successes: &[ToolInvocationResult], errors: &[ToolFailure]) -> String {
    let mut out = String::new();
    for success in successes {
        out.push_str(&format!("✅ **{}**: {}\n\n", success.tool_name, success.message));
    }
    if !errors.is_empty() {
        out.push_str("❌ **Tool Errors:**\n");
        for failure in errors {
            out.push_str(&format!("• {}: {}\n", failure.tool_name, failure.error));
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Answers from a fixed table; unknown tools fail.
    struct FakeInvoker {
        ready: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeInvoker {
        fn new(ready: bool) -> Self {
            Self {
                ready,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolInvoker for FakeInvoker {
        fn is_ready(&self) -> bool {
            self.ready
        }

        async fn call_tool(&self, name: &str, _arguments: Value) -> ToolCallOutcome {
            self.calls.lock().push(name.to_string());
            let ok = |confidence: f64, message: &str| ToolCallOutcome {
                success: true,
                result: Some(json!({ "success": true, "confidence": confidence, "message": message })),
                error: None,
            };
            match name {
                "calculator" => ok(0.9, "Fee is $3.20"),
                "datetime" => ok(0.7, "Support is open now"),
                _ => ToolCallOutcome {
                    success: false,
                    result: None,
                    error: Some(format!("tool '{}' not found", name)),
                },
            }
        }
    }

    fn orchestrator(invoker: Arc<FakeInvoker>, config: ToolConfigFile) -> Orchestrator {
        let routing = RoutingConfig::default();
        let stats = Arc::new(ToolUsageStats::new());
        let selector = Arc::new(FallbackSelector::new(
            None,
            RuleBasedSelector::new(routing.low_confidence_threshold),
            Arc::clone(&stats),
        ));
        Orchestrator::new(invoker, selector, Arc::new(config), routing, stats)
            .with_secret_check(Arc::new(|_: &str| true))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_partial_failure_is_tolerated() {
        let invoker = Arc::new(FakeInvoker::new(true));
        let orch = orchestrator(Arc::clone(&invoker), ToolConfigFile::default());

        let result = orch
            .execute_tools(&names(&["calculator", "weather", "datetime"]), "fee on $100")
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].tool_name, "weather");
        assert!((result.overall_confidence - 0.8).abs() < 1e-6);
        assert_eq!(result.tools_used, names(&["calculator", "weather", "datetime"]));
        assert_eq!(invoker.calls.lock().len(), 3);

        assert!(result.combined_narrative.starts_with("✅ **calculator**: Fee is $3.20"));
        assert!(result.combined_narrative.contains("✅ **datetime**: Support is open now"));
        assert!(result.combined_narrative.ends_with("❌ **Tool Errors:**\n• weather: tool 'weather' not found"));
    }

    #[tokio::test]
    async fn test_no_successes_uses_default_confidence() {
        let orch = orchestrator(Arc::new(FakeInvoker::new(true)), ToolConfigFile::default());
        let result = orch.execute_tools(&names(&["weather"]), "rain?").await.unwrap();
        assert!(result.results.is_empty());
        assert!((result.overall_confidence - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let orch = orchestrator(Arc::new(FakeInvoker::new(false)), ToolConfigFile::default());
        let err = orch.execute_tools(&names(&["calculator"]), "2+2").await.unwrap_err();
        assert!(matches!(err, SupportError::ToolServerUnavailable(_)));

        let empty = orch.execute_tools(&[], "2+2").await.unwrap();
        assert!(empty.tools_used.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_tool_never_selected() {
        let mut config = ToolConfigFile::default();
        config.tools.get_mut("calculator").unwrap().enabled = false;
        let orch = orchestrator(Arc::new(FakeInvoker::new(true)), config);

        let everything = names(&["calculator", "web_search", "datetime"]);
        let picked = orch
            .decide_tools("Calculate 2.9% + $0.30 on $100", 0.9, Some(&everything))
            .await;
        assert!(!picked.contains(&"calculator".to_string()));

        let picked = orch.decide_tools("Calculate 2.9% + $0.30 on $100", 0.2, None).await;
        assert!(!picked.contains(&"calculator".to_string()));
        assert!(picked.contains(&"web_search".to_string()));
    }

    #[tokio::test]
    async fn test_tools_missing_secrets_are_never_selected() {
        let orch = orchestrator(Arc::new(FakeInvoker::new(true)), ToolConfigFile::default())
            .with_secret_check(Arc::new(|_: &str| false));

        let picked = orch.decide_tools("Is the API down? Calculate 2.9% + $0.30", 0.2, None).await;
        assert!(picked.contains(&"calculator".to_string()));
        assert!(!picked.contains(&"web_search".to_string()));
        assert!(!picked.contains(&"status_checker".to_string()));

        let available = orch.available_tools();
        assert!(available.contains(&"calculator".to_string()));
        assert!(!available.contains(&"web_search".to_string()));
    }

    #[tokio::test]
    async fn test_caller_list_narrows_selection() {
        let orch = orchestrator(Arc::new(FakeInvoker::new(true)), ToolConfigFile::default());
        let only_datetime = names(&["datetime"]);
        let picked = orch
            .decide_tools("What time is it? Also calculate 5 + 5", 0.2, Some(&only_datetime))
            .await;
        assert_eq!(picked, only_datetime);
    }
}

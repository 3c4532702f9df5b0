//! Which tools to run for a query.
//!
//! The model-backed selector reads a catalog built from the enabled tools and
//! answers with JSON. The rule-based selector checks each tool's own trigger
//! patterns. `FallbackSelector` tries the first and falls back to the second.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::stats::ToolUsageStats;
use crate::llm::{extract_json_object, LlmClient};
use crate::tools::{ToolDescriptor, ToolKind};

/// An enabled tool as the selectors see it.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    pub description: String,
    pub api_keys: Vec<String>,
    pub dependencies: Vec<String>,
}

impl CatalogEntry {
    pub fn from_descriptor(id: &str, descriptor: &ToolDescriptor) -> Self {
        Self {
            id: id.to_string(),
            description: descriptor.description.clone(),
            api_keys: descriptor.api_keys.clone(),
            dependencies: descriptor.dependencies.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSelection {
    pub tools: Vec<String>,
    pub reasoning: String,
    pub confidence: f32,
}

#[async_trait]
pub trait ToolSelector: Send + Sync {
    async fn select(&self, query: &str, confidence: f32, catalog: &[CatalogEntry]) -> Result<ToolSelection>;
}

/// One line per tool: `- id: description (requires: ...) (dependencies: ...)`.
pub fn render_catalog(catalog: &[CatalogEntry]) -> String {
    catalog
        .iter()
        .map(|entry| {
            let mut line = format!("- {}: {}", entry.id, entry.description);
            if !entry.api_keys.is_empty() {
                line.push_str(&format!(" (requires: {})", entry.api_keys.join(", ")));
            }
            if !entry.dependencies.is_empty() {
                line.push_str(&format!(" (dependencies: {})", entry.dependencies.join(", ")));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Deserialize)]
struct SelectionReply {
    #[serde(rename = "useTool")]
    use_tool: bool,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub struct LlmToolSelector {
    llm: Arc<dyn LlmClient>,
}

impl LlmToolSelector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_prompt(query: &str, confidence: f32, catalog: &[CatalogEntry]) -> String {
        format!(
            r#"You route customer-support questions about a payments API to helper tools.

Available tools:
{catalog}

Guidelines:
- calculator: fee calculations, percentages, arithmetic
- currency_converter: currency conversions and exchange rates
- status_checker: outages, downtime, "is the API down" questions
- code_validator: endpoint, request snippet and API key checks
- datetime: current time, business hours, scheduling
- web_search: recent changes, news, or anything the product documentation cannot answer

Only choose tools from the list above.

If tools are needed, reply with:
{{"useTool": true, "tools": ["tool_a", "tool_b"], "reasoning": "why", "confidence": 0.8}}

If the documentation alone can answer, reply with:
{{"useTool": false, "reasoning": "why"}}

User query: "{query}"
Document confidence: {confidence:.2}

Reply with JSON only."#,
            catalog = render_catalog(catalog),
            query = query,
            confidence = confidence,
        )
    }

    fn parse_reply(raw: &str, confidence: f32) -> Result<ToolSelection> {
        let json = extract_json_object(raw).ok_or_else(|| anyhow!("No JSON object in selector reply"))?;
        let reply: SelectionReply = serde_json::from_str(json).context("Malformed selector reply")?;
        let tools = if reply.use_tool { reply.tools } else { Vec::new() };
        Ok(ToolSelection {
            tools,
            reasoning: reply.reasoning.unwrap_or_else(|| "AI analysis completed".to_string()),
            confidence: reply.confidence.unwrap_or(confidence).clamp(0.0, 1.0),
        })
    }
}

#[async_trait]
impl ToolSelector for LlmToolSelector {
    async fn select(&self, query: &str, confidence: f32, catalog: &[CatalogEntry]) -> Result<ToolSelection> {
        if catalog.is_empty() {
            return Ok(ToolSelection {
                tools: Vec::new(),
                reasoning: "No tools available".to_string(),
                confidence,
            });
        }
        let prompt = Self::build_prompt(query, confidence, catalog);
        let raw = self.llm.generate(&prompt, 256).await?;
        Self::parse_reply(&raw, confidence)
    }
}

/// Per-tool trigger checks, plus web lookup when retrieval confidence is low.
pub struct RuleBasedSelector {
    low_confidence_threshold: f32,
}

impl RuleBasedSelector {
    pub fn new(low_confidence_threshold: f32) -> Self {
        Self {
            low_confidence_threshold,
        }
    }

    pub fn pick(&self, query: &str, confidence: f32, catalog: &[CatalogEntry]) -> Vec<String> {
        let mut tools: Vec<String> = Vec::new();
        for entry in catalog {
            let triggered = ToolKind::parse(&entry.id).is_some_and(|kind| kind.matches(query));
            if triggered && !tools.contains(&entry.id) {
                tools.push(entry.id.clone());
            }
        }

        let web_search = ToolKind::WebSearch.id();
        if confidence < self.low_confidence_threshold
            && !tools.iter().any(|t| t == web_search)
            && catalog.iter().any(|e| e.id == web_search)
        {
            tools.push(web_search.to_string());
        }
        tools
    }
}

#[async_trait]
impl ToolSelector for RuleBasedSelector {
    async fn select(&self, query: &str, confidence: f32, catalog: &[CatalogEntry]) -> Result<ToolSelection> {
        Ok(ToolSelection {
            tools: self.pick(query, confidence, catalog),
            reasoning: "Rule-based pattern matching".to_string(),
            confidence,
        })
    }
}

pub struct FallbackSelector {
    primary: Option<Arc<dyn ToolSelector>>,
    rules: RuleBasedSelector,
    stats: Arc<ToolUsageStats>,
}

impl FallbackSelector {
    pub fn new(primary: Option<Arc<dyn ToolSelector>>, rules: RuleBasedSelector, stats: Arc<ToolUsageStats>) -> Self {
        Self { primary, rules, stats }
    }
}

#[async_trait]
impl ToolSelector for FallbackSelector {
    async fn select(&self, query: &str, confidence: f32, catalog: &[CatalogEntry]) -> Result<ToolSelection> {
        if let Some(primary) = &self.primary {
            match primary.select(query, confidence, catalog).await {
                Ok(selection) => {
                    self.stats.record_selection(true);
                    tracing::info!(tools = ?selection.tools, "🤖 AI tool selection");
                    return Ok(selection);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "AI tool selection failed, using rules");
                }
            }
        }
        self.stats.record_selection(false);
        self.rules.select(query, confidence, catalog).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedLlm(Result<String, String>);

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            self.0.clone().map_err(|e| anyhow!(e))
        }
        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn catalog(ids: &[&str]) -> Vec<CatalogEntry> {
        ids.iter()
            .map(|id| CatalogEntry {
                id: id.to_string(),
                description: format!("{} tool", id),
                api_keys: Vec::new(),
                dependencies: Vec::new(),
            })
            .collect()
    }

    #[test]
    fn test_catalog_lines() {
        let entries = vec![CatalogEntry {
            id: "web_search".into(),
            description: "Search the web".into(),
            api_keys: vec!["GOOGLE_SEARCH_API_KEY".into()],
            dependencies: vec!["google-custom-search".into()],
        }];
        assert_eq!(
            render_catalog(&entries),
            "- web_search: Search the web (requires: GOOGLE_SEARCH_API_KEY) (dependencies: google-custom-search)"
        );
    }

    #[test]
    fn test_rules_add_web_search_on_low_confidence() {
        let rules = RuleBasedSelector::new(0.6);
        let all = catalog(&["calculator", "status_checker", "web_search"]);

        let picked = rules.pick("What is 2.9% of $100?", 0.9, &all);
        assert_eq!(picked, vec!["calculator"]);

        let picked = rules.pick("What is 2.9% of $100?", 0.3, &all);
        assert_eq!(picked, vec!["calculator", "web_search"]);

        let picked = rules.pick("What is 2.9% of $100?", 0.3, &catalog(&["calculator"]));
        assert_eq!(picked, vec!["calculator"]);
    }

    #[test]
    fn test_rules_only_pick_catalog_tools() {
        let rules = RuleBasedSelector::new(0.6);
        let picked = rules.pick("Is the API down? fees are 2.9%", 0.9, &catalog(&["status_checker"]));
        assert_eq!(picked, vec!["status_checker"]);
    }

    #[test]
    fn test_parse_reply() {
        let raw = "```json\n{\"useTool\": true, \"tools\": [\"calculator\"], \"confidence\": 0.9}\n```";
        let selection = LlmToolSelector::parse_reply(raw, 0.5).unwrap();
        assert_eq!(selection.tools, vec!["calculator"]);
        assert_eq!(selection.reasoning, "AI analysis completed");

        let selection = LlmToolSelector::parse_reply(r#"{"useTool": false, "tools": ["x"]}"#, 0.4).unwrap();
        assert!(selection.tools.is_empty());
        assert!((selection.confidence - 0.4).abs() < 1e-6);

        assert!(LlmToolSelector::parse_reply(r#"{"tools": ["calculator"]}"#, 0.5).is_err());
        assert!(LlmToolSelector::parse_reply("no idea", 0.5).is_err());
    }

    #[tokio::test]
    async fn test_fallback_on_llm_failure() {
        let stats = Arc::new(ToolUsageStats::new());
        let broken: Arc<dyn ToolSelector> =
            Arc::new(LlmToolSelector::new(Arc::new(ScriptedLlm(Err("quota".into())))));
        let selector = FallbackSelector::new(Some(broken), RuleBasedSelector::new(0.6), Arc::clone(&stats));

        let selection = selector
            .select("calculate 2 + 2", 0.9, &catalog(&["calculator", "web_search"]))
            .await
            .unwrap();
        assert_eq!(selection.tools, vec!["calculator"]);
        assert_eq!(stats.snapshot().rule_selections, 1);
        assert_eq!(stats.snapshot().ai_selections, 0);
    }

    #[tokio::test]
    async fn test_ai_decline_returns_empty() {
        let stats = Arc::new(ToolUsageStats::new());
        let llm: Arc<dyn ToolSelector> = Arc::new(LlmToolSelector::new(Arc::new(ScriptedLlm(Ok(
            r#"{"useTool": false, "reasoning": "docs cover it"}"#.into(),
        )))));
        let selector = FallbackSelector::new(Some(llm), RuleBasedSelector::new(0.6), Arc::clone(&stats));

        let selection = selector
            .select("calculate 2 + 2", 0.1, &catalog(&["calculator", "web_search"]))
            .await
            .unwrap();
        assert!(selection.tools.is_empty());
        assert_eq!(stats.snapshot().ai_selections, 1);
    }
}

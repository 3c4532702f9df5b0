use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{SupportTool, ToolKind, ToolOutput};

const SEARCH_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";
const MAX_RESULTS: usize = 5;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchItem {
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

/// Google Custom Search lookup for things the docs may not cover yet.
pub struct WebSearchTool {
    client: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl WebSearchTool {
    pub fn new(client: reqwest::Client, api_key: Option<String>, engine_id: Option<String>) -> Self {
        let credentials = api_key.zip(engine_id);
        Self { client, credentials }
    }

    pub fn from_env(client: reqwest::Client) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self::new(client, var("GOOGLE_SEARCH_API_KEY"), var("GOOGLE_SEARCH_ENGINE_ID"))
    }

    async fn search(&self, api_key: &str, engine_id: &str, query: &str) -> Result<Vec<SearchItem>> {
        let num = MAX_RESULTS.to_string();
        let response = self
            .client
            .get(SEARCH_ENDPOINT)
            .query(&[("key", api_key), ("cx", engine_id), ("q", query), ("num", num.as_str())])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("web search request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return Err(anyhow!("web search API error ({}): {}", status, preview));
        }

        let parsed: SearchResponse = response.json().await.context("invalid web search response")?;
        Ok(parsed.items.into_iter().take(MAX_RESULTS).collect())
    }
}

fn summarize(items: &[SearchItem]) -> String {
    let lines: Vec<String> = items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {} ({}): {}", i + 1, item.title, item.link, item.snippet.trim()))
        .collect();
    format!("Found {} web results:\n{}", items.len(), lines.join("\n"))
}

#[async_trait]
impl SupportTool for WebSearchTool {
    fn name(&self) -> &str {
        ToolKind::WebSearch.id()
    }

    fn description(&self) -> &str {
        ToolKind::WebSearch.description()
    }

    fn should_use(&self, query: &str) -> bool {
        ToolKind::WebSearch.matches(query)
    }

    async fn execute(&self, query: &str) -> Result<ToolOutput> {
        let Some((api_key, engine_id)) = self.credentials.as_ref() else {
            return Ok(ToolOutput::failure(
                "GOOGLE_SEARCH_API_KEY and GOOGLE_SEARCH_ENGINE_ID must be set",
            ));
        };

        let items = self.search(api_key, engine_id, query).await?;
        if items.is_empty() {
            return Ok(ToolOutput::failure("No web results found"));
        }

        let confidence = if items.len() >= 3 { 0.75 } else { 0.6 };
        let data = json!({
            "results": items.iter().map(|i| json!({
                "title": i.title,
                "link": i.link,
                "snippet": i.snippet,
            })).collect::<Vec<_>>(),
        });
        Ok(ToolOutput::success(confidence, summarize(&items), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_credentials() {
        let tool = WebSearchTool::new(reqwest::Client::new(), Some("key".into()), None);
        let out = tool.execute("latest api changes").await.unwrap();
        assert!(!out.success);
    }

    #[test]
    fn test_response_without_items() {
        let parsed: SearchResponse = serde_json::from_str(r#"{"kind":"customsearch#search"}"#).unwrap();
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn test_summary_numbering() {
        let items = vec![
            SearchItem { title: "A".into(), link: "https://a".into(), snippet: " one ".into() },
            SearchItem { title: "B".into(), link: "https://b".into(), snippet: "two".into() },
        ];
        let summary = summarize(&items);
        assert!(summary.starts_with("Found 2 web results"));
        assert!(summary.contains("1. A (https://a): one"));
    }
}

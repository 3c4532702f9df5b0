//! Language-model access for the routing steps.
//!
//! Only short, low-temperature decision calls go through here (strategy
//! classification and tool selection). Answer generation is handled elsewhere.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub mod external;

pub use external::{ApiProvider, ExternalProvider};

use crate::config::LlmSettings;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single-turn completion.
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Build a client from settings. Returns `None` when the API key variable is
/// not set, which leaves the AI-assisted paths disabled.
pub fn client_from_settings(settings: &LlmSettings) -> Result<Option<Arc<dyn LlmClient>>> {
    let api_key = match std::env::var(&settings.api_key_env) {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            tracing::info!(
                env = %settings.api_key_env,
                "LLM key not set, routing will use rule tables only"
            );
            return Ok(None);
        }
    };

    let provider = ApiProvider::parse(&settings.provider);
    let client = ExternalProvider::new(
        provider,
        api_key,
        settings.model.clone(),
        settings.timeout_secs,
    )?;
    Ok(Some(Arc::new(client)))
}

/// Extract the outermost JSON object from a model reply.
///
/// Strips markdown fences and any prose around the object. Returns `None`
/// when there is no `{ ... }` span at all.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed).trim();

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_plain_object() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), Some(r#"{"a":1}"#));
    }

    #[test]
    fn test_extract_fenced_object() {
        let raw = "```json\n{\"approach\": \"COMBINED\"}\n```";
        assert_eq!(extract_json_object(raw), Some(r#"{"approach": "COMBINED"}"#));
    }

    #[test]
    fn test_extract_object_with_prose() {
        let raw = "Sure! Here you go: {\"useTool\": false} hope that helps";
        assert_eq!(extract_json_object(raw), Some(r#"{"useTool": false}"#));
    }

    #[test]
    fn test_extract_none() {
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("} backwards {"), None);
    }
}

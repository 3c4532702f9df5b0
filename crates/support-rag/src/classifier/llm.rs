use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::QueryClassifier;
use crate::llm::{extract_json_object, LlmClient};
use crate::types::{Approach, ClassificationDecision};

#[derive(Debug, Deserialize)]
struct ClassifierReply {
    approach: String,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Asks the model to choose a strategy. Fails on any unusable reply so the
/// caller can fall back to the rule table.
pub struct LlmClassifier {
    llm: Arc<dyn LlmClient>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_prompt(query: &str, confidence: f32, enabled: Option<&[String]>) -> String {
        let tools = match enabled {
            Some(list) if list.is_empty() => "none".to_string(),
            Some(list) => list.join(", "),
            None => "all".to_string(),
        };
        format!(
            r#"You classify customer-support questions about a payments API.

User query: "{query}"
Document confidence: {confidence:.2}
Enabled tools: {tools}

Approaches:
1. TOOLS_ONLY - answer directly with tools (fee math, API status, endpoint checks, time, currency, web lookup)
2. RETRIEVAL_ONLY - answer from the product documentation
3. COMBINED - needs both live tool output and documentation
4. MEMORY_ONLY - the user refers to something they said earlier in this conversation

Reply with JSON only:
{{"approach": "TOOLS_ONLY|RETRIEVAL_ONLY|COMBINED|MEMORY_ONLY", "reasoning": "short explanation", "confidence": 0.8}}"#
        )
    }

    fn parse_reply(raw: &str, confidence: f32) -> Result<ClassificationDecision> {
        let json = extract_json_object(raw).ok_or_else(|| anyhow!("No JSON object in classifier reply"))?;
        let reply: ClassifierReply = serde_json::from_str(json).context("Malformed classifier reply")?;
        let approach = Approach::coerce(&reply.approach)
            .ok_or_else(|| anyhow!("Unrecognized approach label '{}'", reply.approach))?;

        Ok(ClassificationDecision {
            approach,
            reasoning: reply.reasoning.unwrap_or_else(|| "AI analysis completed".to_string()),
            confidence: reply.confidence.unwrap_or(confidence).clamp(0.0, 1.0),
            is_conversational: approach == Approach::MemoryOnly,
        })
    }
}

#[async_trait]
impl QueryClassifier for LlmClassifier {
    async fn classify(
        &self,
        query: &str,
        confidence: f32,
        enabled: Option<&[String]>,
    ) -> Result<ClassificationDecision> {
        let prompt = Self::build_prompt(query, confidence, enabled);
        let raw = self.llm.generate(&prompt, 200).await?;
        Self::parse_reply(&raw, confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exact_and_legacy_labels() {
        let d = LlmClassifier::parse_reply(r#"{"approach":"COMBINED","reasoning":"both","confidence":0.7}"#, 0.5)
            .unwrap();
        assert_eq!(d.approach, Approach::Combined);
        assert!((d.confidence - 0.7).abs() < 1e-6);

        let d = LlmClassifier::parse_reply(r#"Sure! {"approach":"MCP_TOOLS_ONLY"}"#, 0.5).unwrap();
        assert_eq!(d.approach, Approach::ToolsOnly);
        assert!((d.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_parse_coerces_free_form_label() {
        let d = LlmClassifier::parse_reply(r#"{"approach":"use the docs search"}"#, 0.5).unwrap();
        assert_eq!(d.approach, Approach::RetrievalOnly);
    }

    #[test]
    fn test_parse_rejects_unusable_replies() {
        assert!(LlmClassifier::parse_reply(r#"{"approach":"banana"}"#, 0.5).is_err());
        assert!(LlmClassifier::parse_reply(r#"{"reasoning":"no label"}"#, 0.5).is_err());
        assert!(LlmClassifier::parse_reply("I think tools", 0.5).is_err());
    }

    #[test]
    fn test_prompt_lists_enabled_tools() {
        let enabled = vec!["calculator".to_string(), "datetime".to_string()];
        let prompt = LlmClassifier::build_prompt("fees?", 0.42, Some(&enabled));
        assert!(prompt.contains("Enabled tools: calculator, datetime"));
        assert!(prompt.contains("Document confidence: 0.42"));
    }
}

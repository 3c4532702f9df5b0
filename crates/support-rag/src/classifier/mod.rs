//! Strategy classification: tools, retrieval, both, or conversation memory.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub mod llm;
pub mod rules;

pub use llm::LlmClassifier;
pub use rules::{is_conversational, RuleBasedClassifier};

use crate::types::{Approach, ClassificationDecision};

#[async_trait]
pub trait QueryClassifier: Send + Sync {
    async fn classify(
        &self,
        query: &str,
        confidence: f32,
        enabled: Option<&[String]>,
    ) -> Result<ClassificationDecision>;
}

/// Tries the model-backed classifier when there is one, then the rule table.
///
/// Conversational references are checked before anything else and always
/// yield `MEMORY_ONLY`, whatever the model would have said.
pub struct FallbackClassifier {
    primary: Option<Arc<dyn QueryClassifier>>,
    rules: RuleBasedClassifier,
}

impl FallbackClassifier {
    pub fn new(primary: Option<Arc<dyn QueryClassifier>>, rules: RuleBasedClassifier) -> Self {
        Self { primary, rules }
    }

    pub fn rules_only(low_confidence_threshold: f32) -> Self {
        Self::new(None, RuleBasedClassifier::new(low_confidence_threshold))
    }

    pub async fn classify(&self, query: &str, confidence: f32, enabled: Option<&[String]>) -> ClassificationDecision {
        if is_conversational(query) {
            let decision = self.rules.decide(query, confidence, enabled);
            tracing::info!(approach = %decision.approach, "Conversational reference");
            return decision;
        }

        if let Some(primary) = &self.primary {
            match primary.classify(query, confidence, enabled).await {
                // The rule table owns the memory route.
                Ok(decision) if decision.approach != Approach::MemoryOnly => {
                    tracing::info!(approach = %decision.approach, reasoning = %decision.reasoning, "🤖 AI classification");
                    return decision;
                }
                Ok(_) => tracing::debug!("AI chose MEMORY_ONLY without a conversational cue, using rules"),
                Err(e) => tracing::warn!(error = %e, "AI classification failed, using rules"),
            }
        }

        let decision = self.rules.decide(query, confidence, enabled);
        tracing::info!(approach = %decision.approach, reasoning = %decision.reasoning, "Rule-based classification");
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmClient;
    use parking_lot::Mutex;

    struct ScriptedLlm {
        reply: Result<String, String>,
        calls: Mutex<usize>,
    }

    impl ScriptedLlm {
        fn new(reply: Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string).map_err(str::to_string),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
            *self.calls.lock() += 1;
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }
        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn with_llm(llm: Arc<ScriptedLlm>) -> FallbackClassifier {
        let primary: Arc<dyn QueryClassifier> = Arc::new(LlmClassifier::new(llm));
        FallbackClassifier::new(Some(primary), RuleBasedClassifier::new(0.6))
    }

    #[tokio::test]
    async fn test_conversational_skips_the_model() {
        let llm = ScriptedLlm::new(Ok(r#"{"approach":"TOOLS_ONLY"}"#));
        let classifier = with_llm(Arc::clone(&llm));

        let d = classifier.classify("what is my name and calculate 5%+ $10", 0.9, None).await;
        assert_eq!(d.approach, Approach::MemoryOnly);
        assert_eq!(*llm.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_model_decision_used_when_valid() {
        let llm = ScriptedLlm::new(Ok(r#"{"approach":"COMBINED","reasoning":"needs both"}"#));
        let d = with_llm(llm).classify("How do refunds work?", 0.9, None).await;
        assert_eq!(d.approach, Approach::Combined);
        assert_eq!(d.reasoning, "needs both");
    }

    #[tokio::test]
    async fn test_model_failure_falls_back() {
        let d = with_llm(ScriptedLlm::new(Err("timeout")))
            .classify("What's 2.9% + $0.30 on $100?", 0.9, None)
            .await;
        assert_eq!(d.approach, Approach::ToolsOnly);

        let d = with_llm(ScriptedLlm::new(Ok(r#"{"approach":"banana"}"#)))
            .classify("How do I set up subscription billing?", 0.9, None)
            .await;
        assert_eq!(d.approach, Approach::RetrievalOnly);
    }

    #[tokio::test]
    async fn test_rules_only() {
        let d = FallbackClassifier::rules_only(0.6)
            .classify("How do I set up subscription billing?", 0.2, None)
            .await;
        assert_eq!(d.approach, Approach::Combined);
    }
}

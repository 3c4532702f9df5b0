use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

use super::QueryClassifier;
use crate::search::is_technical_query;
use crate::types::{Approach, ClassificationDecision};

static CONVERSATIONAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bmy name\b",
        r"\bwho am i\b",
        r"\bwhat('s| is) my (name|email|company|job|role|favou?rite)\b",
        r"\bdo you (know|remember) me\b",
        r"\bwhat did i (say|tell|mention|ask)\b",
        r"\bwhat did we (talk|discuss|say)\b",
        r"\b(our|the) (previous |last |earlier )?(conversation|chat)\b",
        r"\bi (told|mentioned to) you\b",
        r"\bearlier (i|you) (said|mentioned|told)\b",
        r"\bremember\b",
    ])
});

static TOOL_CUES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\d+(\.\d+)?\s*%|\$\s?\d+|\b(fees?|cost|price|calculate|compute|math)\b",
        r"\b(down|status|operational|outage)\b|not working",
        r"\b(latest|recent|recently|updated)\b|\b20[2-9]\d\b",
        r"\b(validate|verify|check|endpoint|api|code)\b",
        r"\b(time|date|schedule|when)\b|business hours",
        r"\bconvert\b|exchange rate|\bcurrenc(y|ies)\b",
    ])
});

static DOC_CUES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bhow (do|to|can|should)\b|\b(implement|set ?up|configure|integrate)\b",
        r"\b(api|endpoint|webhooks?|payments?|billing|subscriptions?|refunds?|disputes?)\b",
        r"\b(documentation|docs|guide|tutorial|example)\b",
        r"\b(errors?|problem|issue|troubleshoot)\b",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("classifier regex is valid"))
        .collect()
}

fn any_match(patterns: &[Regex], lower: &str) -> bool {
    patterns.iter().any(|re| re.is_match(lower))
}

/// References to facts the user shared earlier in the conversation.
pub fn is_conversational(query: &str) -> bool {
    any_match(&CONVERSATIONAL, &query.to_lowercase())
}

/// Deterministic decision table. Always answers.
pub struct RuleBasedClassifier {
    low_confidence_threshold: f32,
}

impl RuleBasedClassifier {
    pub fn new(low_confidence_threshold: f32) -> Self {
        Self {
            low_confidence_threshold,
        }
    }

    pub fn decide(&self, query: &str, confidence: f32, enabled: Option<&[String]>) -> ClassificationDecision {
        let lower = query.to_lowercase();
        let decision = |approach: Approach, reasoning: &str| ClassificationDecision {
            approach,
            reasoning: reasoning.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            is_conversational: approach == Approach::MemoryOnly,
        };

        if any_match(&CONVERSATIONAL, &lower) {
            return decision(Approach::MemoryOnly, "Query refers to earlier conversation");
        }

        let tools_available = enabled.map_or(true, |list| !list.is_empty());
        let has_tool_cue = tools_available && any_match(&TOOL_CUES, &lower);
        let has_doc_cue = any_match(&DOC_CUES, &lower) || is_technical_query(query);

        if has_tool_cue && !has_doc_cue {
            decision(Approach::ToolsOnly, "Query matches tool patterns")
        } else if has_tool_cue && has_doc_cue {
            decision(Approach::Combined, "Query needs both tools and documentation")
        } else if confidence < self.low_confidence_threshold {
            decision(Approach::Combined, "Low retrieval confidence, supplementing with tools")
        } else {
            decision(Approach::RetrievalOnly, "Default to documentation search")
        }
    }
}

#[async_trait]
impl QueryClassifier for RuleBasedClassifier {
    async fn classify(
        &self,
        query: &str,
        confidence: f32,
        enabled: Option<&[String]>,
    ) -> Result<ClassificationDecision> {
        Ok(self.decide(query, confidence, enabled))
    }
}

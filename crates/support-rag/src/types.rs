use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
}

/// A raw hit from one retrieval backend, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub id: Option<String>,
    pub content: String,
    pub metadata: DocumentMetadata,
    pub score: f32,
}

impl ScoredDocument {
    /// Key used to merge the same document across backends. Falls back to a
    /// content prefix when the backend has no identifier for it.
    pub fn fusion_key(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.content.chars().take(100).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Hybrid,
    Keyword,
    Semantic,
    /// Produced by the semantic-only retry after both primary searches failed.
    SemanticFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: Option<String>,
    pub content: String,
    pub metadata: DocumentMetadata,
    pub bm25_score: f32,
    pub semantic_score: f32,
    /// The stronger of the two normalized scores.
    pub normalized_score: f32,
    pub final_score: f32,
    pub search_type: SearchType,
}

/// Restricts retrieval to a category and/or source. Part of the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub category: Option<String>,
    pub source: Option<String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.source.is_none()
    }

    pub fn to_lance_predicate(&self) -> Option<String> {
        let mut predicates = Vec::new();
        if let Some(ref category) = self.category {
            predicates.push(format!("category = '{}'", category.replace('\'', "''")));
        }
        if let Some(ref source) = self.source {
            predicates.push(format!("source = '{}'", source.replace('\'', "''")));
        }
        if predicates.is_empty() {
            None
        } else {
            Some(predicates.join(" AND "))
        }
    }

    pub fn matches(&self, metadata: &DocumentMetadata) -> bool {
        self.category.as_ref().map_or(true, |c| c == &metadata.category)
            && self.source.as_ref().map_or(true, |s| s == &metadata.source)
    }

    pub fn cache_context(&self) -> String {
        if self.is_empty() {
            return "all".to_string();
        }
        format!(
            "category={};source={}",
            self.category.as_deref().unwrap_or("*"),
            self.source.as_deref().unwrap_or("*")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Approach {
    ToolsOnly,
    RetrievalOnly,
    Combined,
    MemoryOnly,
}

impl Approach {
    pub fn as_str(&self) -> &'static str {
        match self {
            Approach::ToolsOnly => "TOOLS_ONLY",
            Approach::RetrievalOnly => "RETRIEVAL_ONLY",
            Approach::Combined => "COMBINED",
            Approach::MemoryOnly => "MEMORY_ONLY",
        }
    }

    /// Map a free-form label onto the closed set.
    ///
    /// Exact names (and the legacy `MCP_TOOLS_ONLY` / `HYBRID_SEARCH` labels)
    /// match first, then substrings in priority order: memory, combined, tools,
    /// retrieval. Returns `None` when nothing matches.
    pub fn coerce(label: &str) -> Option<Self> {
        let upper = label.trim().to_uppercase();
        match upper.as_str() {
            "TOOLS_ONLY" | "MCP_TOOLS_ONLY" => return Some(Approach::ToolsOnly),
            "RETRIEVAL_ONLY" | "HYBRID_SEARCH" => return Some(Approach::RetrievalOnly),
            "COMBINED" => return Some(Approach::Combined),
            "MEMORY_ONLY" => return Some(Approach::MemoryOnly),
            _ => {}
        }

        let has = |needles: &[&str]| needles.iter().any(|n| upper.contains(n));
        if has(&["MEMORY", "CONVERSATION"]) {
            Some(Approach::MemoryOnly)
        } else if has(&["COMBINED", "BOTH"]) {
            Some(Approach::Combined)
        } else if has(&["TOOL", "MCP"]) {
            Some(Approach::ToolsOnly)
        } else if has(&["RETRIEVAL", "SEARCH", "HYBRID", "DOC"]) {
            Some(Approach::RetrievalOnly)
        } else {
            None
        }
    }

    pub fn uses_search(&self) -> bool {
        matches!(self, Approach::RetrievalOnly | Approach::Combined)
    }

    pub fn uses_tools(&self) -> bool {
        matches!(self, Approach::ToolsOnly | Approach::Combined)
    }
}

impl std::fmt::Display for Approach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationDecision {
    pub approach: Approach,
    pub reasoning: String,
    pub confidence: f32,
    pub is_conversational: bool,
}

/// Outcome of one tool call inside an orchestration round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub tool_name: String,
    pub success: bool,
    pub payload: Value,
    pub confidence: f32,
    /// The tool's own human-readable message, if it produced one.
    pub message: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub tool_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub success: bool,
    pub results: BTreeMap<String, ToolInvocationResult>,
    pub errors: Vec<ToolFailure>,
    pub combined_narrative: String,
    pub overall_confidence: f32,
    pub tools_used: Vec<String>,
}

impl OrchestratorResult {
    pub fn empty(default_confidence: f32) -> Self {
        Self {
            success: true,
            results: BTreeMap::new(),
            errors: Vec::new(),
            combined_narrative: String::new(),
            overall_confidence: default_confidence,
            tools_used: Vec::new(),
        }
    }
}

/// Chunk record for storage operations.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
    pub vector: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_exact_labels() {
        assert_eq!(Approach::coerce("TOOLS_ONLY"), Some(Approach::ToolsOnly));
        assert_eq!(Approach::coerce("mcp_tools_only"), Some(Approach::ToolsOnly));
        assert_eq!(Approach::coerce("HYBRID_SEARCH"), Some(Approach::RetrievalOnly));
        assert_eq!(Approach::coerce("MEMORY_ONLY"), Some(Approach::MemoryOnly));
    }

    #[test]
    fn test_coerce_substrings() {
        assert_eq!(Approach::coerce("USE_MCP"), Some(Approach::ToolsOnly));
        assert_eq!(Approach::coerce("tool-based"), Some(Approach::ToolsOnly));
        assert_eq!(Approach::coerce("both sources"), Some(Approach::Combined));
        assert_eq!(Approach::coerce("document lookup"), Some(Approach::RetrievalOnly));
        assert_eq!(Approach::coerce("conversation memory"), Some(Approach::MemoryOnly));
        assert_eq!(Approach::coerce("banana"), None);
    }

    #[test]
    fn test_fusion_key_falls_back_to_content_prefix() {
        let doc = ScoredDocument {
            id: None,
            content: "x".repeat(250),
            metadata: DocumentMetadata::default(),
            score: 1.0,
        };
        assert_eq!(doc.fusion_key().len(), 100);

        let doc = ScoredDocument {
            id: Some("doc_1".into()),
            ..doc
        };
        assert_eq!(doc.fusion_key(), "doc_1");
    }

    #[test]
    fn test_filter_predicate_escapes_quotes() {
        let filter = SearchFilter {
            category: Some("o'brien".into()),
            source: None,
        };
        assert_eq!(
            filter.to_lance_predicate().as_deref(),
            Some("category = 'o''brien'")
        );
        assert!(SearchFilter::default().to_lance_predicate().is_none());
    }
}

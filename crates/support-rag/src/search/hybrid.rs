use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use regex::Regex;

use super::{KeywordIndex, SemanticIndex};
use crate::config::SearchConfig;
use crate::error::SupportError;
use crate::types::{ScoredDocument, SearchFilter, SearchResult, SearchType};

static TECHNICAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Payment decline and processing codes
        r"(?i)card_declined|card_expired|insufficient_funds|invalid_cvc|processing_error|incorrect_number|expired_card",
        // Generic API error identifiers
        r"(?i)err_\d+|error_\d+|api_error|validation_error|invalid_request_error|rate_limit_error",
        // HTTP status codes
        r"\b[45]\d{2}\b",
        // API keys
        r"\b(sk|pk|rk)_(live|test)_[A-Za-z0-9]+",
        // Webhook signing secrets
        r"\bwhsec_[A-Za-z0-9]+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("technical query regex is valid"))
    .collect()
});

/// True for error-code, status-code and credential-shaped queries, where exact
/// term matches matter more than meaning.
pub fn is_technical_query(query: &str) -> bool {
    TECHNICAL_PATTERNS.iter().any(|re| re.is_match(query))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub bm25: f32,
    pub semantic: f32,
}

/// Pick the weight pair for a query. The two weights always sum to 1.
pub fn fusion_weights(query: &str, config: &SearchConfig) -> FusionWeights {
    let bm25 = if is_technical_query(query) {
        config.technical_bm25_weight
    } else {
        config.general_bm25_weight
    };
    FusionWeights {
        bm25,
        semantic: 1.0 - bm25,
    }
}

/// Min-max normalize into [0, 1]. A set whose scores are all equal maps every
/// member to 0.5.
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores.iter().copied().fold(f32::MIN, f32::max);
    let min = scores.iter().copied().fold(f32::MAX, f32::min);
    if (max - min).abs() < 1e-9 {
        return vec![0.5; scores.len()];
    }
    let range = max - min;
    scores.iter().map(|s| (s - min) / range).collect()
}

struct FusedEntry {
    doc: ScoredDocument,
    bm25: Option<f32>,
    semantic: Option<f32>,
}

/// Weighted fusion of normalized keyword and semantic scores.
///
/// Results are keyed on `ScoredDocument::fusion_key`. A document missing from
/// one side scores 0 for that side. Ties keep first-seen order (keyword hits
/// before semantic ones), so the output does not depend on which backend
/// answered first.
pub fn fuse(
    keyword: Vec<ScoredDocument>,
    semantic: Vec<ScoredDocument>,
    weights: FusionWeights,
    top_k: usize,
) -> Vec<SearchResult> {
    let keyword_norm = min_max_normalize(&keyword.iter().map(|d| d.score).collect::<Vec<_>>());
    let semantic_norm = min_max_normalize(&semantic.iter().map(|d| d.score).collect::<Vec<_>>());

    let mut entries: Vec<FusedEntry> = Vec::with_capacity(keyword.len() + semantic.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (doc, norm) in keyword.into_iter().zip(keyword_norm) {
        let key = doc.fusion_key();
        match positions.get(&key) {
            Some(&pos) => {
                let entry = &mut entries[pos];
                entry.bm25 = Some(entry.bm25.map_or(norm, |s| s.max(norm)));
            }
            None => {
                positions.insert(key, entries.len());
                entries.push(FusedEntry {
                    doc,
                    bm25: Some(norm),
                    semantic: None,
                });
            }
        }
    }

    for (doc, norm) in semantic.into_iter().zip(semantic_norm) {
        let key = doc.fusion_key();
        match positions.get(&key) {
            Some(&pos) => {
                let entry = &mut entries[pos];
                entry.semantic = Some(entry.semantic.map_or(norm, |s| s.max(norm)));
            }
            None => {
                positions.insert(key, entries.len());
                entries.push(FusedEntry {
                    doc,
                    bm25: None,
                    semantic: Some(norm),
                });
            }
        }
    }

    let mut merged: Vec<SearchResult> = entries
        .into_iter()
        .map(|entry| {
            let search_type = match (entry.bm25.is_some(), entry.semantic.is_some()) {
                (true, true) => SearchType::Hybrid,
                (true, false) => SearchType::Keyword,
                _ => SearchType::Semantic,
            };
            let bm25 = entry.bm25.unwrap_or(0.0);
            let semantic = entry.semantic.unwrap_or(0.0);
            SearchResult {
                id: entry.doc.id,
                content: entry.doc.content,
                metadata: entry.doc.metadata,
                bm25_score: bm25,
                semantic_score: semantic,
                normalized_score: bm25.max(semantic),
                final_score: weights.semantic * semantic + weights.bm25 * bm25,
                search_type,
            }
        })
        .collect();

    merged.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(top_k);
    merged
}

/// Keyword + semantic retrieval with query-adaptive fusion.
pub struct HybridSearchEngine {
    keyword: Option<Arc<dyn KeywordIndex>>,
    semantic: Option<Arc<dyn SemanticIndex>>,
    config: SearchConfig,
    timeout: Duration,
}

impl HybridSearchEngine {
    pub fn new(
        keyword: Option<Arc<dyn KeywordIndex>>,
        semantic: Option<Arc<dyn SemanticIndex>>,
        config: SearchConfig,
    ) -> Self {
        let timeout = Duration::from_secs(config.search_timeout_secs);
        Self {
            keyword,
            semantic,
            config,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_backend(&self) -> bool {
        self.keyword.is_some() || self.semantic.is_some()
    }

    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>, SupportError> {
        self.search_filtered(query, top_k, &SearchFilter::default()).await
    }

    pub async fn search_filtered(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>, SupportError> {
        if !self.has_backend() {
            return Err(SupportError::NoSearchBackend);
        }

        let weights = fusion_weights(query, &self.config);
        let candidates = top_k * self.config.candidate_multiplier;

        let keyword_fut = async {
            match &self.keyword {
                Some(index) => Some(self.bounded("keyword", index.search(query, candidates, filter)).await),
                None => None,
            }
        };
        let semantic_fut = async {
            match &self.semantic {
                Some(index) => Some(self.bounded("semantic", index.search(query, candidates, filter)).await),
                None => None,
            }
        };
        let (keyword_outcome, semantic_outcome) = tokio::join!(keyword_fut, semantic_fut);

        let keyword_failed = !matches!(keyword_outcome, Some(Ok(_)));
        let semantic_failed = !matches!(semantic_outcome, Some(Ok(_)));

        if keyword_failed && semantic_failed {
            return self.semantic_fallback(query, top_k, filter, weights).await;
        }

        let keyword_hits = match keyword_outcome {
            Some(Ok(hits)) => hits,
            _ => Vec::new(),
        };
        let semantic_hits = match semantic_outcome {
            Some(Ok(hits)) => hits,
            _ => Vec::new(),
        };
        let keyword_count = keyword_hits.len();
        let semantic_count = semantic_hits.len();

        let results = fuse(keyword_hits, semantic_hits, weights, top_k);

        tracing::info!(
            query = %query,
            bm25_weight = weights.bm25,
            semantic_weight = weights.semantic,
            keyword_hits = keyword_count,
            semantic_hits = semantic_count,
            fused = results.len(),
            top_score = results.first().map(|r| r.final_score).unwrap_or(0.0),
            "Hybrid search complete"
        );

        Ok(results)
    }

    /// Every primary search path failed. Retry semantic-only with the caller's
    /// `top_k`.
    async fn semantic_fallback(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
        weights: FusionWeights,
    ) -> Result<Vec<SearchResult>, SupportError> {
        let Some(index) = &self.semantic else {
            return Err(SupportError::SearchUnavailable(
                "keyword search failed and no semantic backend is configured".into(),
            ));
        };

        tracing::warn!(query = %query, "Hybrid search failed, falling back to semantic-only search");
        match self.bounded("semantic fallback", index.search(query, top_k, filter)).await {
            Ok(hits) => {
                let mut results = fuse(Vec::new(), hits, weights, top_k);
                for result in &mut results {
                    result.search_type = SearchType::SemanticFallback;
                }
                Ok(results)
            }
            Err(e) => Err(SupportError::SearchUnavailable(e.to_string())),
        }
    }

    async fn bounded<F>(&self, label: &str, fut: F) -> Result<Vec<ScoredDocument>>
    where
        F: Future<Output = Result<Vec<ScoredDocument>>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(hits)) => Ok(hits),
            Ok(Err(e)) => {
                tracing::warn!(source = label, error = %e, "Search source failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(source = label, timeout_ms = self.timeout.as_millis() as u64, "Search source timed out");
                Err(anyhow::anyhow!("{} search timed out", label))
            }
        }
    }
}

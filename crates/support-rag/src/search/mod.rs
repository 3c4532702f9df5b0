//! Retrieval backends and the fusion engine that sits on top of them.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ScoredDocument, SearchFilter};

pub mod cache;
pub mod hybrid;
pub mod text_search;
pub mod vector_store;

pub use cache::{normalize_query, CacheStats, ResultCache};
pub use hybrid::{fusion_weights, is_technical_query, min_max_normalize, FusionWeights, HybridSearchEngine};
pub use text_search::TextSearch;
pub use vector_store::{LanceVectorStore, SemanticSearch};

/// Term-statistics ranking over a full-text index.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredDocument>>;
}

/// Embedding-similarity ranking. Scores are similarities, higher is better.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredDocument>>;
}

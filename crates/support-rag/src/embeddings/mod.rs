pub mod api;

use anyhow::Result;
use async_trait::async_trait;

pub use api::ApiEmbeddings;

/// Unified embedding model trait
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a search query
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a document/passage for indexing
    async fn embed_document(&self, text: &str) -> Result<Vec<f32>>;

    /// Embedding vector dimension
    fn dimension(&self) -> usize;
}

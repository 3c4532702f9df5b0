//! Loading a chunk corpus into the keyword index and the vector table.
//!
//! Input is a JSON document `{"chunks": [...]}`. Each chunk carries its text,
//! metadata, and optionally an id and a precomputed embedding.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

use crate::embeddings::EmbeddingModel;
use crate::search::{LanceVectorStore, TextSearch};
use crate::types::{ChunkRecord, DocumentMetadata};

const VECTOR_BATCH: usize = 64;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorpusMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorpusChunk {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: CorpusMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Corpus {
    pub chunks: Vec<CorpusChunk>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub total: usize,
    pub keyword_indexed: usize,
    pub vectors_indexed: usize,
    /// Chunks whose embedding had to be computed here.
    pub embedded: usize,
    pub failed: Vec<String>,
    pub duration_ms: u64,
}

pub async fn load_corpus(path: &Path) -> Result<Corpus> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read corpus {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid corpus file {}", path.display()))
}

impl Corpus {
    /// Chunks without an id get `doc_<index>`.
    pub fn into_records(self) -> Vec<(ChunkRecord, Option<Vec<f32>>)> {
        self.chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let id = chunk
                    .id
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| format!("doc_{}", i));
                let source = if chunk.metadata.source.is_empty() {
                    chunk.metadata.source_url
                } else {
                    chunk.metadata.source
                };
                let record = ChunkRecord {
                    id,
                    content: chunk.content,
                    metadata: DocumentMetadata {
                        source,
                        title: chunk.metadata.title,
                        category: chunk.metadata.category,
                    },
                    vector: Vec::new(),
                };
                (record, chunk.embedding)
            })
            .collect()
    }
}

/// Index every chunk. Per-chunk failures are logged and reported, never
/// fatal. Without a vector store only the keyword index is filled.
pub async fn ingest(
    corpus: Corpus,
    keyword: &TextSearch,
    vectors: Option<(&LanceVectorStore, &dyn EmbeddingModel)>,
) -> Result<IngestReport> {
    let started = Instant::now();
    let records = corpus.into_records();
    let mut report = IngestReport {
        total: records.len(),
        ..Default::default()
    };
    tracing::info!(chunks = report.total, "📚 Ingesting corpus");

    let mut pending: Vec<ChunkRecord> = Vec::with_capacity(VECTOR_BATCH);
    for (mut record, embedding) in records {
        if record.content.trim().is_empty() {
            tracing::warn!(id = %record.id, "Skipping empty chunk");
            report.failed.push(record.id);
            continue;
        }

        if let Err(e) = keyword.index_chunk(&record) {
            tracing::warn!(id = %record.id, error = %e, "Keyword indexing failed");
            report.failed.push(record.id.clone());
        } else {
            report.keyword_indexed += 1;
        }

        let Some((store, embedder)) = vectors else {
            continue;
        };
        record.vector = match embedding.filter(|v| v.len() == store.dimension()) {
            Some(vector) => vector,
            None => match embedder.embed_document(&record.content).await {
                Ok(vector) => {
                    report.embedded += 1;
                    vector
                }
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "Embedding failed");
                    if !report.failed.contains(&record.id) {
                        report.failed.push(record.id);
                    }
                    continue;
                }
            },
        };
        pending.push(record);

        if pending.len() >= VECTOR_BATCH {
            flush(store, &mut pending, &mut report).await;
        }
    }
    if let Some((store, _)) = vectors {
        flush(store, &mut pending, &mut report).await;
    }

    keyword.commit()?;
    report.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        keyword = report.keyword_indexed,
        vectors = report.vectors_indexed,
        embedded = report.embedded,
        failed = report.failed.len(),
        duration_ms = report.duration_ms,
        "✅ Ingestion complete"
    );
    Ok(report)
}

async fn flush(store: &LanceVectorStore, pending: &mut Vec<ChunkRecord>, report: &mut IngestReport) {
    if pending.is_empty() {
        return;
    }
    let batch = std::mem::take(pending);
    match store.upsert_chunks(&batch).await {
        Ok(()) => report.vectors_indexed += batch.len(),
        Err(e) => {
            tracing::warn!(chunks = batch.len(), error = %e, "Vector batch failed");
            for record in batch {
                if !report.failed.contains(&record.id) {
                    report.failed.push(record.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::KeywordIndex;
    use crate::types::SearchFilter;

    const CORPUS: &str = r#"{
        "chunks": [
            {"id": "refunds_1", "content": "Refunds can be issued within 180 days of the charge.",
             "metadata": {"title": "Refunds", "source_url": "https://docs.example.com/refunds", "category": "payments"}},
            {"content": "A card_declined error means the issuer rejected the charge.",
             "metadata": {"title": "Declines", "source": "declines.md", "category": "errors"}},
            {"content": "   ", "metadata": {}}
        ]
    }"#;

    #[test]
    fn test_missing_ids_and_source_url() {
        let corpus: Corpus = serde_json::from_str(CORPUS).unwrap();
        let records = corpus.into_records();
        assert_eq!(records[0].0.id, "refunds_1");
        assert_eq!(records[0].0.metadata.source, "https://docs.example.com/refunds");
        assert_eq!(records[1].0.id, "doc_1");
        assert_eq!(records[1].0.metadata.source, "declines.md");
    }

    #[tokio::test]
    async fn test_keyword_only_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.json");
        std::fs::write(&path, CORPUS).unwrap();

        let corpus = load_corpus(&path).await.unwrap();
        let index = TextSearch::in_memory().unwrap();
        let report = ingest(corpus, &index, None).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.keyword_indexed, 2);
        assert_eq!(report.failed, vec!["doc_2".to_string()]);
        assert_eq!(index.count(), 2);

        let hits = index.search("card_declined", 5, &SearchFilter::default()).await.unwrap();
        assert_eq!(hits[0].id.as_deref(), Some("doc_1"));
    }

    #[tokio::test]
    async fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{\"documents\": []}").unwrap();
        assert!(load_corpus(&path).await.is_err());
    }
}

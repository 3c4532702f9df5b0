use anyhow::{anyhow, Context, Result};
use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use std::path::Path;
use std::sync::Arc;

use super::SemanticIndex;
use crate::embeddings::EmbeddingModel;
use crate::types::{ChunkRecord, DocumentMetadata, ScoredDocument, SearchFilter};

const SEED_ID: &str = "__seed__";

/// LanceDB table of embedded support chunks, searched by cosine distance.
pub struct LanceVectorStore {
    db: lancedb::Connection,
    dimension: usize,
    table_name: String,
}

impl LanceVectorStore {
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create vector dir {}", path.display()))?;
        let uri = path
            .to_str()
            .ok_or_else(|| anyhow!("vector store path is not valid UTF-8"))?;
        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        let store = Self {
            db,
            dimension,
            table_name: "support_chunks".to_string(),
        };

        store.ensure_table().await?;
        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("source", DataType::Utf8, false),
            Field::new("category", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    fn build_batch(&self, chunks: &[ChunkRecord]) -> Result<RecordBatch> {
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let titles: Vec<&str> = chunks.iter().map(|c| c.metadata.title.as_str()).collect();
        let sources: Vec<&str> = chunks.iter().map(|c| c.metadata.source.as_str()).collect();
        let categories: Vec<&str> = chunks.iter().map(|c| c.metadata.category.as_str()).collect();

        let flat_vectors: Vec<f32> = chunks.iter().flat_map(|c| c.vector.iter().copied()).collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(contents)),
                Arc::new(StringArray::from(titles)),
                Arc::new(StringArray::from(sources)),
                Arc::new(StringArray::from(categories)),
                Arc::new(vector_array) as Arc<dyn Array>,
            ],
        )
        .context("Failed to create RecordBatch")
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&self.table_name) {
            return Ok(());
        }

        // Create with a seed record, then delete it
        let seed = ChunkRecord {
            id: SEED_ID.to_string(),
            content: String::new(),
            metadata: DocumentMetadata::default(),
            vector: vec![0.0; self.dimension],
        };
        let batch = self.build_batch(std::slice::from_ref(&seed))?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], self.schema());
        self.db
            .create_table(&self.table_name, Box::new(batches))
            .execute()
            .await
            .context("Failed to create support_chunks table")?;

        let table = self.db.open_table(&self.table_name).execute().await?;
        table.delete(&format!("id = '{}'", SEED_ID)).await.ok();
        Ok(())
    }

    /// Insert chunks, replacing rows that share an id.
    pub async fn upsert_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        if let Some(bad) = chunks.iter().find(|c| c.vector.len() != self.dimension) {
            return Err(anyhow!(
                "chunk {} has dimension {}, store expects {}",
                bad.id,
                bad.vector.len(),
                self.dimension
            ));
        }

        let table = self
            .db
            .open_table(&self.table_name)
            .execute()
            .await
            .context("Failed to open support_chunks table")?;

        let id_list = chunks
            .iter()
            .map(|c| format!("'{}'", c.id.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        table
            .delete(&format!("id IN ({})", id_list))
            .await
            .context("Failed to remove previous versions")?;

        let batch = self.build_batch(chunks)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], self.schema());
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("Failed to insert chunks")?;

        tracing::debug!("Inserted {} chunks into LanceDB", chunks.len());
        Ok(())
    }

    pub async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<ScoredDocument>> {
        let table = self.db.open_table(&self.table_name).execute().await?;

        let mut query_builder = table
            .query()
            .nearest_to(query)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k);

        if let Some(predicate) = filter {
            query_builder = query_builder.only_if(predicate);
        }

        let results = query_builder
            .execute()
            .await
            .context("LanceDB vector search failed")?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(extract_hits_from_batches(&batches))
    }

    pub async fn clear(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&self.table_name) {
            self.db.drop_table(&self.table_name, &[]).await?;
        }
        self.ensure_table().await
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        Ok(table.count_rows(None).await?)
    }
}

/// Cosine distance becomes a similarity in [0, 1].
fn extract_hits_from_batches(batches: &[RecordBatch]) -> Vec<ScoredDocument> {
    let mut hits = Vec::new();
    for batch in batches {
        let column = |name: &str| {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        };
        let (Some(ids), Some(contents)) = (column("id"), column("content")) else {
            continue;
        };
        let titles = column("title");
        let sources = column("source");
        let categories = column("category");
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        for i in 0..batch.num_rows() {
            let score = distances.map_or(0.0, |d| (1.0 - d.value(i)).max(0.0));
            let text_at = |col: Option<&StringArray>| col.map(|c| c.value(i).to_string()).unwrap_or_default();
            hits.push(ScoredDocument {
                id: Some(ids.value(i).to_string()),
                content: contents.value(i).to_string(),
                metadata: DocumentMetadata {
                    source: text_at(sources),
                    title: text_at(titles),
                    category: text_at(categories),
                },
                score,
            });
        }
    }
    hits
}

/// Embeds the query and searches the vector store.
pub struct SemanticSearch {
    store: Arc<LanceVectorStore>,
    embedder: Arc<dyn EmbeddingModel>,
}

impl SemanticSearch {
    pub fn new(store: Arc<LanceVectorStore>, embedder: Arc<dyn EmbeddingModel>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait]
impl SemanticIndex for SemanticSearch {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredDocument>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let embedding = self
            .embedder
            .embed_query(query)
            .await
            .context("query embedding failed")?;
        let predicate = filter.to_lance_predicate();
        self.store
            .vector_search(&embedding, limit, predicate.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, vector: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            content: format!("content of {}", id),
            metadata: DocumentMetadata {
                source: "docs".into(),
                title: id.to_string(),
                category: "general".into(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_nearest_neighbour() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceVectorStore::open(dir.path(), 3).await.unwrap();
        store
            .upsert_chunks(&[
                chunk("x", vec![1.0, 0.0, 0.0]),
                chunk("y", vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        let hits = store.vector_search(&[0.9, 0.1, 0.0], 2, None).await.unwrap();
        assert_eq!(hits[0].id.as_deref(), Some("x"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceVectorStore::open(dir.path(), 3).await.unwrap();
        store.upsert_chunks(&[chunk("x", vec![1.0, 0.0, 0.0])]).await.unwrap();
        store.upsert_chunks(&[chunk("x", vec![0.0, 0.0, 1.0])]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_wrong_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceVectorStore::open(dir.path(), 3).await.unwrap();
        let err = store.upsert_chunks(&[chunk("x", vec![1.0])]).await;
        assert!(err.is_err());
    }
}

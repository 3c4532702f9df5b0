use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Schema, Value as TantivyValue, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use super::KeywordIndex;
use crate::types::{ChunkRecord, DocumentMetadata, ScoredDocument, SearchFilter};

#[derive(Clone, Copy)]
struct Fields {
    id: schema::Field,
    content: schema::Field,
    title: schema::Field,
    source: schema::Field,
    category: schema::Field,
}

/// BM25 keyword index over support documents.
///
/// Tantivy's default BM25 parameters (k1 = 1.2, b = 0.75) are used as is.
pub struct TextSearch {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    fields: Fields,
}

impl TextSearch {
    /// `id`, `source` and `category` are STRING (indexed, not tokenized) so
    /// that term deletes and exact filters work.
    fn build_schema() -> (Schema, Fields) {
        let mut sb = Schema::builder();
        let fields = Fields {
            id: sb.add_text_field("id", STRING | STORED),
            content: sb.add_text_field("content", TEXT | STORED),
            title: sb.add_text_field("title", TEXT | STORED),
            source: sb.add_text_field("source", STRING | STORED),
            category: sb.add_text_field("category", STRING | STORED),
        };
        (sb.build(), fields)
    }

    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create index dir {}", path.display()))?;
        let (schema, fields) = Self::build_schema();

        let dir = tantivy::directory::MmapDirectory::open(path)?;
        let index = if Index::exists(&dir)? {
            Index::open_in_dir(path)?
        } else {
            Index::create_in_dir(path, schema)?
        };
        Self::from_index(index, fields)
    }

    pub fn in_memory() -> Result<Self> {
        let (schema, fields) = Self::build_schema();
        Self::from_index(Index::create_in_ram(schema), fields)
    }

    fn from_index(index: Index, fields: Fields) -> Result<Self> {
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create Tantivy reader")?;

        let writer = index
            .writer(50_000_000)
            .context("Failed to create Tantivy writer")?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            fields,
        })
    }

    /// Replaces any existing document with the same id. Visible after `commit`.
    pub fn index_chunk(&self, chunk: &ChunkRecord) -> Result<()> {
        let writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.fields.id, &chunk.id));
        writer.add_document(doc!(
            self.fields.id => chunk.id.as_str(),
            self.fields.content => chunk.content.as_str(),
            self.fields.title => chunk.metadata.title.as_str(),
            self.fields.source => chunk.metadata.source.as_str(),
            self.fields.category => chunk.metadata.category.as_str(),
        ))?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit().context("Tantivy commit failed")?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_all_documents()?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }
}

fn run_query(
    index: &Index,
    reader: &IndexReader,
    fields: Fields,
    query: &str,
    limit: usize,
    filter: &SearchFilter,
) -> Result<Vec<ScoredDocument>> {
    let searcher = reader.searcher();
    let query_parser = QueryParser::for_index(index, vec![fields.content, fields.title]);

    // Error codes and API tokens are full of characters the query grammar
    // treats as operators. Retry as a phrase.
    let parsed_query = match query_parser.parse_query(query) {
        Ok(q) => q,
        Err(_) => {
            let escaped_query = query.replace('"', "");
            let fallback_parser = QueryParser::for_index(index, vec![fields.content]);
            fallback_parser.parse_query(&format!("\"{}\"", escaped_query))?
        }
    };

    // Filters are applied after ranking, so over-fetch.
    let fetch_limit = if filter.is_empty() { limit } else { limit * 3 };
    let top_docs = searcher.search(&parsed_query, &TopDocs::with_limit(fetch_limit.max(1)))?;

    let stored = |doc: &TantivyDocument, field: schema::Field| -> String {
        doc.get_first(field)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    let mut results = Vec::with_capacity(limit);
    for (score, doc_address) in top_docs {
        let Ok(doc) = searcher.doc::<TantivyDocument>(doc_address) else {
            continue;
        };
        let metadata = DocumentMetadata {
            source: stored(&doc, fields.source),
            title: stored(&doc, fields.title),
            category: stored(&doc, fields.category),
        };
        if !filter.matches(&metadata) {
            continue;
        }
        let id = stored(&doc, fields.id);
        results.push(ScoredDocument {
            id: (!id.is_empty()).then_some(id),
            content: stored(&doc, fields.content),
            metadata,
            score,
        });
        if results.len() >= limit {
            break;
        }
    }

    Ok(results)
}

#[async_trait]
impl KeywordIndex for TextSearch {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredDocument>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let index = self.index.clone();
        let reader = self.reader.clone();
        let fields = self.fields;
        let query = query.to_string();
        let filter = filter.clone();

        tokio::task::spawn_blocking(move || {
            run_query(&index, &reader, fields, &query, limit, &filter)
        })
        .await
        .context("keyword search task failed")?
    }
}

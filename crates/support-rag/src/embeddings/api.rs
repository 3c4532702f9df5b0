//! Remote embedding providers (Gemini `embedContent`, OpenAI `/v1/embeddings`).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::EmbeddingModel;
use crate::config::EmbeddingSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum EmbedMode {
    Query,
    Document,
}

#[derive(Debug, Clone, PartialEq)]
enum EmbeddingProvider {
    Google,
    OpenAI,
}

pub struct ApiEmbeddings {
    provider: EmbeddingProvider,
    model: String,
    api_key: String,
    dimension: usize,
    client: Client,
    cache: Arc<Mutex<lru::LruCache<String, Vec<f32>>>>,
}

impl ApiEmbeddings {
    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env)
            .with_context(|| format!("embedding key {} is not set", settings.api_key_env))?;
        let provider = match settings.provider.to_lowercase().as_str() {
            "google" | "gemini" => EmbeddingProvider::Google,
            "openai" => EmbeddingProvider::OpenAI,
            other => return Err(anyhow!("unsupported embedding provider: {}", other)),
        };
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        let capacity = NonZeroUsize::new(settings.cache_size.max(1))
            .ok_or_else(|| anyhow!("cache size must be non-zero"))?;

        Ok(Self {
            provider,
            model: settings.model.clone(),
            api_key,
            dimension: settings.dimension,
            client,
            cache: Arc::new(Mutex::new(lru::LruCache::new(capacity))),
        })
    }

    async fn embed_with_mode(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>> {
        let cache_key = format!("{:?}:{}", mode, text);
        if let Some(cached) = self.cache.lock().get(&cache_key) {
            return Ok(cached.clone());
        }

        let embedding = match self.provider {
            EmbeddingProvider::Google => self.google_embed(text, mode).await?,
            EmbeddingProvider::OpenAI => self.openai_embed(text).await?,
        };
        if embedding.len() != self.dimension {
            return Err(anyhow!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            ));
        }

        self.cache.lock().put(cache_key, embedding.clone());
        Ok(embedding)
    }

    async fn google_embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>> {
        let endpoint = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:embedContent",
            self.model
        );
        let task_type = match mode {
            EmbedMode::Query => "RETRIEVAL_QUERY",
            EmbedMode::Document => "RETRIEVAL_DOCUMENT",
        };
        let request = json!({
            "model": format!("models/{}", self.model),
            "content": { "parts": [{ "text": text }] },
            "taskType": task_type,
        });

        let response = self
            .client
            .post(&endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("request to {} failed", endpoint))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("embedding API error ({}): {}", status, body));
        }
        let parsed: GoogleEmbedResponse = response.json().await?;
        Ok(parsed.embedding.values)
    }

    async fn openai_embed(&self, text: &str) -> Result<Vec<f32>> {
        let endpoint = "https://api.openai.com/v1/embeddings";
        let request = json!({ "model": self.model, "input": text });

        let response = self
            .client
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("request to {} failed", endpoint))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("embedding API error ({}): {}", status, body));
        }
        let parsed: OpenAIEmbedResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow!("embedding API returned no data"))
    }
}

#[async_trait]
impl EmbeddingModel for ApiEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with_mode(text, EmbedMode::Query).await
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with_mode(text, EmbedMode::Document).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Deserialize)]
struct GoogleEmbedResponse {
    embedding: GoogleEmbedding,
}

#[derive(Deserialize)]
struct GoogleEmbedding {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct OpenAIEmbedResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

//! Hosted chat-completion APIs used for routing decisions.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::time::Duration;

use super::LlmClient;

/// Decision calls want deterministic output.
const DECISION_TEMPERATURE: f32 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub enum ApiProvider {
    OpenAI,
    Anthropic,
    Google,
    /// Any OpenAI-compatible chat endpoint.
    Custom { endpoint: String },
}

impl ApiProvider {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "openai" => Self::OpenAI,
            "anthropic" | "claude" => Self::Anthropic,
            "google" | "gemini" => Self::Google,
            _ => Self::Custom {
                endpoint: name.trim().to_string(),
            },
        }
    }

    fn endpoint(&self, model: &str) -> String {
        match self {
            Self::OpenAI => "https://api.openai.com/v1/chat/completions".to_string(),
            Self::Anthropic => "https://api.anthropic.com/v1/messages".to_string(),
            Self::Google => format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
                model
            ),
            Self::Custom { endpoint } => endpoint.clone(),
        }
    }

    /// Where the completion text sits in the provider's reply.
    fn text_pointer(&self) -> &'static str {
        match self {
            Self::OpenAI | Self::Custom { .. } => "/choices/0/message/content",
            Self::Anthropic => "/content/0/text",
            Self::Google => "/candidates/0/content/parts/0/text",
        }
    }
}

pub struct ExternalProvider {
    provider: ApiProvider,
    api_key: String,
    model: String,
    endpoint: String,
    http: Client,
}

impl ExternalProvider {
    pub fn new(provider: ApiProvider, api_key: String, model: String, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        let endpoint = provider.endpoint(&model);

        Ok(Self {
            provider,
            api_key,
            model,
            endpoint,
            http,
        })
    }

    fn request_body(&self, prompt: &str, max_tokens: u32) -> Value {
        match self.provider {
            ApiProvider::Google => json!({
                "contents": [{ "parts": [{ "text": prompt }] }],
                "generationConfig": {
                    "temperature": DECISION_TEMPERATURE,
                    "maxOutputTokens": max_tokens,
                }
            }),
            _ => json!({
                "model": self.model,
                "messages": [{ "role": "user", "content": prompt }],
                "max_tokens": max_tokens,
                "temperature": DECISION_TEMPERATURE,
            }),
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.provider {
            ApiProvider::Anthropic => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01"),
            ApiProvider::Google => builder.header("x-goog-api-key", &self.api_key),
            _ => builder.bearer_auth(&self.api_key),
        }
    }

    fn reply_text(&self, reply: &Value) -> Result<String> {
        reply
            .pointer(self.provider.text_pointer())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("No completion text in reply from {}", self.endpoint))
    }
}

#[async_trait]
impl LlmClient for ExternalProvider {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let request = self
            .http
            .post(&self.endpoint)
            .json(&self.request_body(prompt, max_tokens));
        let response = self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow!("Request to {} timed out", self.endpoint)
            } else {
                anyhow!("Request to {} failed: {}", self.endpoint, e)
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read reply from {}", self.endpoint))?;
        if !status.is_success() {
            let preview: String = body.chars().take(300).collect();
            return Err(anyhow!("API error ({}): {}", status, preview));
        }
        // Proxies and captive portals answer with HTML.
        if body.trim_start().starts_with('<') {
            return Err(anyhow!("{} returned HTML instead of JSON (HTTP {})", self.endpoint, status));
        }

        let reply: Value = serde_json::from_str(&body)
            .with_context(|| format!("Invalid JSON from {}", self.endpoint))?;
        self.reply_text(&reply)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

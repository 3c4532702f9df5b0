use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tool_server: ToolServerSettings,
    #[serde(default)]
    pub llm: Option<LlmSettings>,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_top_k: usize,
    /// Each backend is asked for `top_k * candidate_multiplier` hits.
    pub candidate_multiplier: usize,
    /// BM25 weight for error-code and API-token queries.
    pub technical_bm25_weight: f32,
    /// BM25 weight for everything else.
    pub general_bm25_weight: f32,
    pub search_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            candidate_multiplier: 2,
            technical_bm25_weight: 0.6,
            general_bm25_weight: 0.3,
            search_timeout_secs: 10,
        }
    }
}

/// Heuristic thresholds used by the classifier and the tool selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Below this retrieval confidence, queries are supplemented with tools
    /// and the selector adds an external lookup.
    pub low_confidence_threshold: f32,
    /// Overall tool confidence when no tool reported one.
    pub default_tool_confidence: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            low_confidence_threshold: 0.6,
            default_tool_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Expired entries are swept once the cache grows past this size.
    pub cleanup_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 60,
            cleanup_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolServerSettings {
    /// Explicit launch command. When unset the bundled server next to the
    /// current executable is used.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub call_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

impl ToolServerSettings {
    pub fn call_timeout_secs(&self) -> u64 {
        self.call_timeout_secs.unwrap_or(20)
    }

    pub fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs.unwrap_or(10)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// One of `openai`, `anthropic`, `google`, or an OpenAI-compatible base URL.
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub dimension: usize,
    pub cache_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "google".to_string(),
            model: "text-embedding-004".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            dimension: 768,
            cache_size: 1000,
        }
    }
}

impl SupportConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.search.default_top_k == 0 {
            return Err("search.default_top_k must be > 0".into());
        }
        if self.search.candidate_multiplier == 0 {
            return Err("search.candidate_multiplier must be > 0".into());
        }
        for (name, w) in [
            ("search.technical_bm25_weight", self.search.technical_bm25_weight),
            ("search.general_bm25_weight", self.search.general_bm25_weight),
            ("routing.low_confidence_threshold", self.routing.low_confidence_threshold),
            ("routing.default_tool_confidence", self.routing.default_tool_confidence),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(format!("{} must be in [0.0, 1.0]", name));
            }
        }
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.cache.ttl_secs == 0 {
            return Err("cache.ttl_secs must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn keyword_index_dir(&self) -> PathBuf {
        self.data_dir.join("keyword_index")
    }

    pub fn vector_store_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    pub fn tool_config_path(&self) -> PathBuf {
        self.data_dir.join("tool-config.json")
    }
}

impl Default for SupportConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("support-rag");

        Self {
            data_dir,
            search: SearchConfig::default(),
            routing: RoutingConfig::default(),
            cache: CacheConfig::default(),
            tool_server: ToolServerSettings::default(),
            llm: None,
            embedding: EmbeddingSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SupportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.search.candidate_multiplier, 2);
        assert_eq!(config.cache.ttl_secs, 420);
    }

    #[test]
    fn test_rejects_out_of_range_weight() {
        let mut config = SupportConfig::default();
        config.search.technical_bm25_weight = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.contains("technical_bm25_weight"));
    }

    #[test]
    fn test_from_file_fills_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"data_dir": "/tmp/support", "search": {"default_top_k": 8}}"#,
        )
        .unwrap();

        let config = SupportConfig::from_file(&path).unwrap();
        assert_eq!(config.search.default_top_k, 8);
        assert_eq!(config.search.candidate_multiplier, 2);
        assert!((config.routing.low_confidence_threshold - 0.6).abs() < 1e-6);
        assert!(config.llm.is_none());
    }
}

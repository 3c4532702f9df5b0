//! The query path: classify, then search and/or run tools, then hand one
//! merged outcome to whoever writes the answer.

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::classifier::{FallbackClassifier, LlmClassifier, QueryClassifier, RuleBasedClassifier};
use crate::config::{RoutingConfig, SearchConfig, SupportConfig};
use crate::embeddings::{ApiEmbeddings, EmbeddingModel};
use crate::error::{SupportError, SupportResult};
use crate::llm::client_from_settings;
use crate::orchestrator::{
    FallbackSelector, LlmToolSelector, Orchestrator, RuleBasedSelector, ToolSelector, ToolUsageStats,
    UsageSnapshot,
};
use crate::protocol::{ToolClient, ToolInvoker, ToolServerConfig};
use crate::search::{
    CacheStats, HybridSearchEngine, KeywordIndex, LanceVectorStore, ResultCache, SemanticIndex,
    SemanticSearch, TextSearch,
};
use crate::tools::{ToolConfigFile, ToolConfigManager, ToolStatusSummary};
use crate::types::{Approach, ClassificationDecision, OrchestratorResult, SearchFilter, SearchResult};

/// Retrieval confidence assumed when the caller has none.
pub const DEFAULT_RETRIEVAL_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub confidence: Option<f32>,
    pub top_k: Option<usize>,
    pub filter: SearchFilter,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub query_id: Uuid,
    pub query: String,
    pub decision: ClassificationDecision,
    pub search_results: Vec<SearchResult>,
    pub tool_result: Option<OrchestratorResult>,
    pub tool_error: Option<String>,
    pub search_error: Option<String>,
    /// Confidence in the gathered material, 0 when nothing was found.
    pub confidence: f32,
    pub nothing_relevant: bool,
}

/// Retrieval confidence from the fused list: the top score plus 0.1 per
/// result (up to five), kept within [0.1, 0.9].
pub fn retrieval_confidence(results: &[SearchResult]) -> Option<f32> {
    let top = results.first()?.final_score;
    let bonus = results.len().min(5) as f32 * 0.1;
    Some((top + bonus).clamp(0.1, 0.9))
}

pub struct SupportPipeline {
    classifier: FallbackClassifier,
    search: HybridSearchEngine,
    search_config: SearchConfig,
    routing: RoutingConfig,
    invoker: Arc<dyn ToolInvoker>,
    selector: Arc<dyn ToolSelector>,
    tool_config: Arc<ToolConfigManager>,
    orchestrator: RwLock<Arc<Orchestrator>>,
    admin_lock: tokio::sync::Mutex<()>,
    search_cache: ResultCache<Vec<SearchResult>>,
    decision_cache: ResultCache<ClassificationDecision>,
    stats: Arc<ToolUsageStats>,
}

pub struct PipelineParts {
    pub classifier: FallbackClassifier,
    pub search: HybridSearchEngine,
    pub invoker: Arc<dyn ToolInvoker>,
    pub selector: Arc<dyn ToolSelector>,
    pub tool_config: Arc<ToolConfigManager>,
    pub stats: Arc<ToolUsageStats>,
}

impl SupportPipeline {
    pub fn new(parts: PipelineParts, config: &SupportConfig) -> Self {
        let orchestrator = Orchestrator::new(
            Arc::clone(&parts.invoker),
            Arc::clone(&parts.selector),
            parts.tool_config.snapshot(),
            config.routing.clone(),
            Arc::clone(&parts.stats),
        );
        Self {
            classifier: parts.classifier,
            search: parts.search,
            search_config: config.search.clone(),
            routing: config.routing.clone(),
            invoker: parts.invoker,
            selector: parts.selector,
            tool_config: parts.tool_config,
            orchestrator: RwLock::new(Arc::new(orchestrator)),
            admin_lock: tokio::sync::Mutex::new(()),
            search_cache: ResultCache::from_config(&config.cache),
            decision_cache: ResultCache::from_config(&config.cache),
            stats: parts.stats,
        }
    }

    /// Wire up every backend from configuration. Missing pieces (no
    /// embedding key, no model key, tool server failing to start) degrade
    /// the pipeline instead of failing it.
    pub async fn bootstrap(config: &SupportConfig) -> Result<(Self, Arc<ToolClient>)> {
        config.validate().map_err(SupportError::Config)?;
        let threshold = config.routing.low_confidence_threshold;

        let tool_config = Arc::new(ToolConfigManager::load(config.tool_config_path()).await?);

        let keyword: Option<Arc<dyn KeywordIndex>> = match TextSearch::open(&config.keyword_index_dir()) {
            Ok(index) => Some(Arc::new(index)),
            Err(e) => {
                tracing::warn!(error = %e, "Keyword index unavailable");
                None
            }
        };
        let semantic = open_semantic(config).await;
        let search = HybridSearchEngine::new(keyword, semantic, config.search.clone());

        let llm = match config.llm.as_ref().map(client_from_settings).transpose() {
            Ok(llm) => llm.flatten(),
            Err(e) => {
                tracing::warn!(error = %e, "LLM client unavailable, using rule tables");
                None
            }
        };

        let stats = Arc::new(ToolUsageStats::new());
        let classifier = FallbackClassifier::new(
            llm.clone()
                .map(|llm| Arc::new(LlmClassifier::new(llm)) as Arc<dyn QueryClassifier>),
            RuleBasedClassifier::new(threshold),
        );
        let selector: Arc<dyn ToolSelector> = Arc::new(FallbackSelector::new(
            llm.map(|llm| Arc::new(LlmToolSelector::new(llm)) as Arc<dyn ToolSelector>),
            RuleBasedSelector::new(threshold),
            Arc::clone(&stats),
        ));

        let client = Arc::new(ToolClient::from_settings(&config.tool_server));
        match ToolServerConfig::from_settings(&config.tool_server) {
            Ok(server) => {
                if !client.initialize(&server).await {
                    tracing::warn!("Tool server did not start, tools are unavailable this session");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Cannot locate tool server"),
        }

        let parts = PipelineParts {
            classifier,
            search,
            invoker: Arc::clone(&client) as Arc<dyn ToolInvoker>,
            selector,
            tool_config,
            stats,
        };
        Ok((Self::new(parts, config), client))
    }

    /// The current orchestrator generation.
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator.read())
    }

    pub async fn process(&self, query: &str, options: &QueryOptions) -> SupportResult<QueryOutcome> {
        let query_id = Uuid::new_v4();
        let confidence = options
            .confidence
            .unwrap_or(DEFAULT_RETRIEVAL_CONFIDENCE)
            .clamp(0.0, 1.0);
        let top_k = options.top_k.unwrap_or(self.search_config.default_top_k).max(1);

        // One orchestrator for the whole request, so the enabled set cannot
        // change halfway through.
        let orchestrator = self.orchestrator();
        let enabled = orchestrator.available_tools();

        let decision = self.classify(query, confidence, &enabled).await;
        tracing::info!(%query_id, approach = %decision.approach, "Processing query");

        let mut outcome = QueryOutcome {
            query_id,
            query: query.to_string(),
            decision: decision.clone(),
            search_results: Vec::new(),
            tool_result: None,
            tool_error: None,
            search_error: None,
            confidence: 0.0,
            nothing_relevant: false,
        };

        match decision.approach {
            Approach::MemoryOnly => {
                outcome.confidence = decision.confidence;
                return Ok(outcome);
            }
            Approach::RetrievalOnly => {
                let results = self.run_search(query, top_k, &options.filter).await?;
                outcome.search_results = results.as_ref().clone();
            }
            Approach::ToolsOnly => {
                match self.run_tools(&orchestrator, query, confidence, &enabled).await {
                    Ok(result) if !result.results.is_empty() => outcome.tool_result = Some(result),
                    tools => {
                        tracing::info!(%query_id, "Tools gave nothing usable, falling back to search");
                        let search = self.run_search(query, top_k, &options.filter).await;
                        match (search, tools) {
                            (Err(_), Err(tool_err)) => return Err(tool_err),
                            (search, tools) => {
                                match search {
                                    Ok(results) => outcome.search_results = results.as_ref().clone(),
                                    Err(e) => outcome.search_error = Some(e.to_string()),
                                }
                                match tools {
                                    Ok(result) => outcome.tool_result = Some(result),
                                    Err(e) => outcome.tool_error = Some(e.to_string()),
                                }
                            }
                        }
                    }
                }
            }
            Approach::Combined => {
                let (search, tools) = tokio::join!(
                    self.run_search(query, top_k, &options.filter),
                    self.run_tools(&orchestrator, query, confidence, &enabled)
                );
                match (search, tools) {
                    (Err(search_err), Err(tool_err)) => {
                        tracing::warn!(%query_id, tool_error = %tool_err, "Every source failed");
                        return Err(search_err);
                    }
                    (search, tools) => {
                        match search {
                            Ok(results) => outcome.search_results = results.as_ref().clone(),
                            Err(e) => outcome.search_error = Some(e.to_string()),
                        }
                        match tools {
                            Ok(result) => outcome.tool_result = Some(result),
                            Err(e) => outcome.tool_error = Some(e.to_string()),
                        }
                    }
                }
            }
        }

        let search_confidence = retrieval_confidence(&outcome.search_results);
        let tool_confidence = outcome
            .tool_result
            .as_ref()
            .filter(|r| !r.results.is_empty())
            .map(|r| r.overall_confidence);
        let signals: Vec<f32> = search_confidence.into_iter().chain(tool_confidence).collect();
        outcome.nothing_relevant = signals.is_empty();
        outcome.confidence = if signals.is_empty() {
            0.0
        } else {
            signals.iter().sum::<f32>() / signals.len() as f32
        };

        tracing::info!(
            %query_id,
            results = outcome.search_results.len(),
            tools = outcome.tool_result.as_ref().map_or(0, |r| r.results.len()),
            confidence = outcome.confidence,
            nothing_relevant = outcome.nothing_relevant,
            "Query complete"
        );
        Ok(outcome)
    }

    async fn classify(&self, query: &str, confidence: f32, enabled: &[String]) -> ClassificationDecision {
        let context = format!("{:.2}|{}", confidence, enabled.join(","));
        if let Some(cached) = self.decision_cache.get(query, &context) {
            return cached.as_ref().clone();
        }
        let decision = self.classifier.classify(query, confidence, Some(enabled)).await;
        self.decision_cache.insert(query, &context, decision.clone());
        decision
    }

    async fn run_search(
        &self,
        query: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> SupportResult<Arc<Vec<SearchResult>>> {
        let context = format!("top_k={};{}", top_k, filter.cache_context());
        if let Some(cached) = self.search_cache.get(query, &context) {
            return Ok(cached);
        }
        let results = self.search.search_filtered(query, top_k, filter).await?;
        if results.is_empty() {
            return Ok(Arc::new(results));
        }
        Ok(self.search_cache.insert(query, &context, results))
    }

    async fn run_tools(
        &self,
        orchestrator: &Orchestrator,
        query: &str,
        confidence: f32,
        enabled: &[String],
    ) -> SupportResult<OrchestratorResult> {
        let names = orchestrator.decide_tools(query, confidence, Some(enabled)).await;
        if names.is_empty() {
            return Ok(OrchestratorResult::empty(self.routing.default_tool_confidence));
        }
        orchestrator.execute_tools(&names, query).await
    }

    pub fn tool_status(&self) -> ToolStatusSummary {
        self.tool_config.status_summary()
    }

    pub async fn enable_tool(&self, id: &str) -> SupportResult<Arc<ToolConfigFile>> {
        let _guard = self.admin_lock.lock().await;
        let snapshot = self.tool_config.enable(id).await?;
        self.rebuild(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub async fn disable_tool(&self, id: &str) -> SupportResult<Arc<ToolConfigFile>> {
        let _guard = self.admin_lock.lock().await;
        let snapshot = self.tool_config.disable(id).await?;
        self.rebuild(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub async fn toggle_tool(&self, id: &str) -> SupportResult<Arc<ToolConfigFile>> {
        let _guard = self.admin_lock.lock().await;
        let snapshot = self.tool_config.toggle(id).await?;
        self.rebuild(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub async fn reset_tool_config(&self) -> SupportResult<Arc<ToolConfigFile>> {
        let _guard = self.admin_lock.lock().await;
        let snapshot = self.tool_config.reset().await?;
        self.rebuild(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Swap in a fresh orchestrator built from `snapshot`. Requests already
    /// running keep the generation they started with.
    fn rebuild(&self, snapshot: Arc<ToolConfigFile>) {
        let enabled = snapshot.enabled_tools();
        let orchestrator = Orchestrator::new(
            Arc::clone(&self.invoker),
            Arc::clone(&self.selector),
            snapshot,
            self.routing.clone(),
            Arc::clone(&self.stats),
        );
        *self.orchestrator.write() = Arc::new(orchestrator);
        tracing::info!(enabled = ?enabled, "🔄 Orchestrator rebuilt");
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_usage(&self) {
        self.stats.reset();
    }

    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (self.search_cache.stats(), self.decision_cache.stats())
    }

    pub fn clear_caches(&self) {
        self.search_cache.clear();
        self.decision_cache.clear();
    }
}

async fn open_semantic(config: &SupportConfig) -> Option<Arc<dyn SemanticIndex>> {
    let embedder = match ApiEmbeddings::from_settings(&config.embedding) {
        Ok(embedder) => Arc::new(embedder) as Arc<dyn EmbeddingModel>,
        Err(e) => {
            tracing::warn!(error = %e, "Semantic search disabled");
            return None;
        }
    };
    match LanceVectorStore::open(&config.vector_store_dir(), embedder.dimension()).await {
        Ok(store) => Some(Arc::new(SemanticSearch::new(Arc::new(store), embedder))),
        Err(e) => {
            tracing::warn!(error = %e, "Vector store unavailable");
            None
        }
    }
}

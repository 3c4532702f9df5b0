pub mod classifier;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod protocol;
pub mod search;
pub mod tools;
pub mod types;

// Re-export primary types for convenience
pub use config::SupportConfig;
pub use error::{SupportError, SupportResult};
pub use pipeline::{QueryOptions, QueryOutcome, SupportPipeline};
pub use types::{Approach, ClassificationDecision, OrchestratorResult, SearchFilter, SearchResult};

// Re-export common types
pub use anyhow::{Error, Result};
pub use uuid::Uuid;

//! support-rag command line.
//!
//! ```bash
//! support-rag ingest chunks.json
//! support-rag ask "What's 2.9% + \$0.30 on \$100?"
//! support-rag tools disable web_search
//! ```

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use support_rag::embeddings::{ApiEmbeddings, EmbeddingModel};
use support_rag::ingest::{ingest, load_corpus};
use support_rag::search::{LanceVectorStore, TextSearch};
use support_rag::tools::ToolConfigManager;
use support_rag::{QueryOptions, SearchFilter, SupportConfig, SupportPipeline};

#[derive(Parser)]
#[command(name = "support-rag")]
#[command(author, version, about = "Customer-support query routing over docs and tools")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route one question and print the gathered material as JSON
    Ask {
        query: String,

        /// Retrieval confidence from an earlier pass, 0..1
        #[arg(long)]
        confidence: Option<f32>,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        #[arg(long)]
        category: Option<String>,
    },
    /// Inspect or change which tools are enabled
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },
    /// Load a chunk corpus into the keyword index and vector table
    Ingest {
        path: PathBuf,

        /// Skip embeddings and the vector table
        #[arg(long)]
        keyword_only: bool,

        /// Drop existing index contents first
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Subcommand)]
enum ToolsAction {
    List,
    Enable { id: String },
    Disable { id: String },
    Toggle { id: String },
    /// Re-enable every tool
    Reset,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("support_rag=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("Command failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => SupportConfig::from_file(path).map_err(|e| anyhow!(e))?,
        None => SupportConfig::default(),
    };

    match cli.command {
        Commands::Ask {
            query,
            confidence,
            top_k,
            category,
        } => {
            let (pipeline, client) = SupportPipeline::bootstrap(&config).await?;
            let options = QueryOptions {
                confidence,
                top_k,
                filter: SearchFilter {
                    category,
                    ..SearchFilter::default()
                },
            };
            let outcome = pipeline.process(&query, &options).await;
            client.close().await;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
        }
        Commands::Tools { action } => {
            let manager = ToolConfigManager::load(config.tool_config_path()).await?;
            match action {
                ToolsAction::List => {}
                ToolsAction::Enable { id } => {
                    manager.enable(&id).await?;
                }
                ToolsAction::Disable { id } => {
                    manager.disable(&id).await?;
                }
                ToolsAction::Toggle { id } => {
                    manager.toggle(&id).await?;
                }
                ToolsAction::Reset => {
                    manager.reset().await?;
                }
            }
            println!("{}", serde_json::to_string_pretty(&manager.status_summary())?);
        }
        Commands::Ingest {
            path,
            keyword_only,
            reset,
        } => {
            let corpus = load_corpus(&path).await?;
            std::fs::create_dir_all(&config.data_dir)?;
            let keyword = TextSearch::open(&config.keyword_index_dir())?;
            if reset {
                keyword.clear()?;
            }

            let semantic = if keyword_only {
                None
            } else {
                let embedder = ApiEmbeddings::from_settings(&config.embedding)?;
                let store = LanceVectorStore::open(&config.vector_store_dir(), embedder.dimension()).await?;
                if reset {
                    store.clear().await?;
                }
                Some((store, embedder))
            };

            let vectors = semantic
                .as_ref()
                .map(|(store, embedder)| (store, embedder as &dyn EmbeddingModel));
            let report = ingest(corpus, &keyword, vectors).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

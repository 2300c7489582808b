use clap::{Parser, Subcommand};
use corpus_qa_core::{
    CharacterNgramEmbedder, EmbeddingClient, HealthState, HttpEmbeddingClient, HttpLlmClient,
    PipelineConfig, PipelineOrchestrator, QdrantStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "corpus-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Qdrant base URL
    #[arg(long, default_value = "http://localhost:6333")]
    qdrant_url: String,

    /// Qdrant collection holding the indexed chunks
    #[arg(long, default_value = "corpus_chunks")]
    collection: String,

    /// OpenAI-compatible chat API base URL
    #[arg(long, default_value = "http://localhost:11434/v1")]
    llm_url: String,

    /// Chat model used for decomposition, synthesis, and judging
    #[arg(long, default_value = "llama3.1")]
    llm_model: String,

    /// OpenAI-compatible embeddings API base URL. Omit to embed with the
    /// builtin character n-gram embedder.
    #[arg(long)]
    embedding_url: Option<String>,

    /// Embedding model name
    #[arg(long, default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Embedding vector size; must match the collection
    #[arg(long, default_value = "128")]
    dimensions: usize,

    /// Bearer token for the model services
    #[arg(long, env = "CORPUS_QA_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,

    /// Per-request model timeout in milliseconds
    #[arg(long, default_value = "60000")]
    model_timeout_ms: u64,

    /// Overall deadline per question in milliseconds
    #[arg(long)]
    run_timeout_ms: Option<u64>,

    /// Extra domain allowed for fetching, on top of the builtin allow-list
    /// (repeatable)
    #[arg(long = "allow-domain")]
    allow_domains: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, chunk, embed, and index source URLs.
    Ingest {
        /// Source URLs; each must be on the fetch allow-list.
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Answer a question over the indexed corpus, with citations.
    Ask {
        question: String,

        /// Score the answer with the model-as-judge metrics.
        #[arg(long, default_value_t = false)]
        evaluate: bool,

        /// Reference answer; enables the correctness metric and implies
        /// --evaluate.
        #[arg(long)]
        gold_answer: Option<String>,
    },
    /// Probe the vector store and report pipeline health.
    Health,
    /// Print the pipeline metrics counters.
    Stats,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.embedding_dimensions = self.dimensions;
        config.run_timeout_ms = self.run_timeout_ms;
        config
            .fetch
            .allowed_domains
            .extend(self.allow_domains.iter().cloned());
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.pipeline_config();
    let model_timeout = Duration::from_millis(cli.model_timeout_ms);
    let llm = Arc::new(HttpLlmClient::new(
        &cli.llm_url,
        &cli.api_key,
        &cli.llm_model,
        model_timeout,
    )?);
    let store = Arc::new(QdrantStore::new(
        &cli.qdrant_url,
        &cli.collection,
        config.embedding_dimensions,
    ));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        collection = %cli.collection,
        "corpus-qa boot"
    );

    match cli.embedding_url.clone() {
        Some(url) => {
            let embedder = Arc::new(HttpEmbeddingClient::new(
                &url,
                &cli.api_key,
                &cli.embedding_model,
                config.embedding_dimensions,
                model_timeout,
            )?);
            let orchestrator =
                PipelineOrchestrator::new(config, llm, embedder, Arc::clone(&store))?;
            run(cli.command, orchestrator, store).await
        }
        None => {
            let embedder = Arc::new(CharacterNgramEmbedder {
                dimensions: config.embedding_dimensions,
            });
            let orchestrator =
                PipelineOrchestrator::new(config, llm, embedder, Arc::clone(&store))?;
            run(cli.command, orchestrator, store).await
        }
    }
}

async fn run<E: EmbeddingClient>(
    command: Command,
    orchestrator: PipelineOrchestrator<HttpLlmClient, E, QdrantStore>,
    store: Arc<QdrantStore>,
) -> anyhow::Result<()> {
    match command {
        Command::Ingest { urls } => {
            store.ensure_collection().await?;
            let report = orchestrator.ingest(&urls).await?;

            for skipped in &report.skipped_sources {
                warn!(url = %skipped.url, reason = %skipped.reason, "skipped source");
            }
            println!(
                "{} documents ingested, {} chunks indexed, {} sources skipped",
                report.documents_ingested,
                report.chunks_indexed,
                report.skipped_sources.len()
            );
        }
        Command::Ask {
            question,
            evaluate,
            gold_answer,
        } => {
            let report = orchestrator.ask(&question).await?;

            println!("{}", report.answer.answer_text);
            if !report.answer.citations.is_empty() {
                println!();
                for citation in &report.answer.citations {
                    println!("[{}] chunk {}", citation.marker, citation.chunk_id);
                }
            }
            for degradation in &report.degradations {
                warn!(?degradation, "degraded answer");
            }
            info!(
                elapsed_ms = report.elapsed_ms,
                sub_queries = report.answer.sub_queries.len(),
                context_chunks = report.context.len(),
                "question answered"
            );

            if evaluate || gold_answer.is_some() {
                let evaluation = orchestrator.evaluate(&report, gold_answer.as_deref()).await;
                println!();
                println!("{}", serde_json::to_string_pretty(&evaluation)?);
            }
        }
        Command::Health => {
            let health = orchestrator.health_check().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            anyhow::ensure!(
                health.state != HealthState::Unhealthy,
                "pipeline unhealthy: {}",
                health.detail
            );
        }
        Command::Stats => {
            let snapshot = orchestrator.metrics().snapshot();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}

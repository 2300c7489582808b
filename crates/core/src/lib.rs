pub mod chunking;
pub mod config;
pub mod decompose;
pub mod embeddings;
pub mod error;
pub mod evaluate;
pub mod extractor;
pub mod fetcher;
pub mod ingest;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod retrieve;
pub mod stores;
pub mod synthesize;
pub mod traits;

pub use config::{
    ChunkingOptions, DecompositionOptions, EvaluationOptions, FetchOptions, PipelineConfig,
    RetrievalOptions,
};
pub use decompose::QueryDecomposer;
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingClient, HttpEmbeddingClient, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IngestError, ModelError, QueryError, StoreError};
pub use evaluate::{EvaluationReport, Evaluator, MetricKind, MetricScore};
pub use extractor::{ScraperExtractor, TextExtractor};
pub use fetcher::{FetchResult, FetchedPayload, RateLimitedFetcher};
pub use ingest::{IngestionPipeline, IngestionReport, SkippedSource};
pub use llm::{Completion, CompletionConstraints, HttpLlmClient, LlmClient};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use models::{
    Chunk, Citation, Degradation, EmbeddedChunk, RetrievedChunk, SourceDocument, SubQuery,
    SynthesizedAnswer,
};
pub use orchestrator::{
    AnswerReport, HealthState, HealthStatus, PipelineOrchestrator, PipelineState,
};
pub use retrieve::{RetrievalOutcome, Retriever};
pub use stores::{MemoryVectorStore, QdrantStore};
pub use synthesize::{SynthesisOutcome, Synthesizer, INSUFFICIENT_EVIDENCE};
pub use traits::{ScoredHit, VectorStore};

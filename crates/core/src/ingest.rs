use crate::chunking;
use crate::config::{ChunkingOptions, FetchOptions};
use crate::embeddings::EmbeddingClient;
use crate::error::{IngestError, ModelError, Result};
use crate::extractor::{ScraperExtractor, TextExtractor};
use crate::fetcher::{FetchedPayload, RateLimitedFetcher};
use crate::metrics::PipelineMetrics;
use crate::models::{EmbeddedChunk, SourceDocument};
use crate::traits::VectorStore;
use serde::Serialize;
use std::sync::Arc;

/// A source URL that was left out of the index, with the reason it failed.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedSource {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct IngestionReport {
    pub documents_ingested: usize,
    pub chunks_indexed: usize,
    pub skipped_sources: Vec<SkippedSource>,
}

/// Fetch, extract, chunk, embed, and upsert a batch of source URLs.
/// Ingestion is best-effort per source: one bad URL lands in
/// `skipped_sources` while the rest of the batch is indexed.
pub struct IngestionPipeline<E, S> {
    fetcher: RateLimitedFetcher,
    extractor: Box<dyn TextExtractor>,
    chunking: ChunkingOptions,
    embedder: Arc<E>,
    store: Arc<S>,
    metrics: Arc<PipelineMetrics>,
}

impl<E: EmbeddingClient, S: VectorStore> IngestionPipeline<E, S> {
    pub fn new(
        fetch: FetchOptions,
        chunking: ChunkingOptions,
        embedder: Arc<E>,
        store: Arc<S>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        Ok(Self {
            fetcher: RateLimitedFetcher::new(fetch, Arc::clone(&metrics))?,
            extractor: Box::new(ScraperExtractor::default()),
            chunking,
            embedder,
            store,
            metrics,
        })
    }

    /// Swap in a site-specific extractor in place of the markup-aware default.
    pub fn with_extractor(mut self, extractor: Box<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub async fn ingest(&self, urls: &[String]) -> Result<IngestionReport> {
        if urls.is_empty() {
            return Err(IngestError::InvalidArgument(
                "no source urls provided".to_string(),
            ));
        }

        let mut report = IngestionReport::default();
        for result in self.fetcher.fetch(urls).await {
            let outcome = match result.outcome {
                Ok(payload) => self.index_payload(&payload).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(chunk_count) => {
                    report.documents_ingested += 1;
                    report.chunks_indexed += chunk_count;
                }
                Err(err) => {
                    tracing::warn!(url = %result.url, error = %err, "skipping source");
                    report.skipped_sources.push(SkippedSource {
                        url: result.url,
                        reason: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            documents = report.documents_ingested,
            chunks = report.chunks_indexed,
            skipped = report.skipped_sources.len(),
            "ingestion run finished"
        );
        Ok(report)
    }

    async fn index_payload(&self, payload: &FetchedPayload) -> Result<usize> {
        let text = self.extractor.extract(
            &payload.url,
            payload.content_type.as_deref(),
            &payload.body,
        )?;
        let document = SourceDocument::new(&payload.url, text);
        let chunks = chunking::split(&document.id, &document.text, &self.chunking)?;
        if chunks.is_empty() {
            return Err(IngestError::Extract {
                url: payload.url.clone(),
                reason: "no indexable text after chunking".to_string(),
            });
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        PipelineMetrics::bump(&self.metrics.embedding_calls);
        let vectors = match self.embedder.embed_batch(&texts).await {
            Ok(vectors) => vectors,
            Err(err) => {
                PipelineMetrics::bump(&self.metrics.embedding_failures);
                return Err(IngestError::Model(err));
            }
        };
        if vectors.len() != chunks.len() {
            PipelineMetrics::bump(&self.metrics.embedding_failures);
            return Err(IngestError::Model(ModelError::Malformed {
                service: "embeddings".to_string(),
                details: format!("expected {} vectors, got {}", chunks.len(), vectors.len()),
            }));
        }

        let embedded: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
            .collect();

        PipelineMetrics::bump(&self.metrics.store_upserts);
        let upsert = self.store.upsert(&embedded).await;
        self.metrics.record_store_outcome(upsert.is_ok());
        upsert?;

        PipelineMetrics::bump(&self.metrics.documents_ingested);
        PipelineMetrics::add(&self.metrics.chunks_indexed, embedded.len() as u64);
        Ok(embedded.len())
    }
}

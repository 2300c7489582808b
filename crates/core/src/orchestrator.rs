use crate::config::PipelineConfig;
use crate::decompose::QueryDecomposer;
use crate::embeddings::EmbeddingClient;
use crate::error::{IngestError, QueryError};
use crate::evaluate::{EvaluationReport, Evaluator};
use crate::ingest::{IngestionPipeline, IngestionReport};
use crate::llm::LlmClient;
use crate::metrics::PipelineMetrics;
use crate::models::{Degradation, RetrievedChunk, SubQuery, SynthesizedAnswer};
use crate::retrieve::Retriever;
use crate::synthesize::Synthesizer;
use crate::traits::VectorStore;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Observable position of the pipeline. Purely informational: transitions
/// are driven by the entrypoints, never awaited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Ingesting,
    Ready,
    Decomposing,
    Retrieving,
    Synthesizing,
    Evaluating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub detail: String,
}

/// Everything one answered question produced, including the retrieved
/// context so the answer can be evaluated later.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerReport {
    pub answer: SynthesizedAnswer,
    pub context: Vec<RetrievedChunk>,
    pub degradations: Vec<Degradation>,
    pub elapsed_ms: u64,
}

/// Front door of the pipeline: wires fetching, chunking, embedding, and the
/// vector store into the ingestion path, and decomposition, retrieval, and
/// synthesis into the query path. One orchestrator owns one metrics registry
/// and one state flag; all entrypoints take `&self`.
pub struct PipelineOrchestrator<L, E, S> {
    config: PipelineConfig,
    ingestion: IngestionPipeline<E, S>,
    decomposer: QueryDecomposer<L>,
    retriever: Retriever<E, S>,
    synthesizer: Synthesizer<L>,
    evaluator: Evaluator<L>,
    store: Arc<S>,
    metrics: Arc<PipelineMetrics>,
    state: RwLock<PipelineState>,
    ingested: AtomicBool,
}

impl<L, E, S> PipelineOrchestrator<L, E, S>
where
    L: LlmClient,
    E: EmbeddingClient,
    S: VectorStore,
{
    pub fn new(
        config: PipelineConfig,
        llm: Arc<L>,
        embedder: Arc<E>,
        store: Arc<S>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        if embedder.dimensions() != config.embedding_dimensions {
            return Err(IngestError::InvalidArgument(format!(
                "embedder produces {} dimensions, config expects {}",
                embedder.dimensions(),
                config.embedding_dimensions
            )));
        }

        let metrics = Arc::new(PipelineMetrics::new());
        let ingestion = IngestionPipeline::new(
            config.fetch.clone(),
            config.chunking,
            Arc::clone(&embedder),
            Arc::clone(&store),
            Arc::clone(&metrics),
        )?;
        let decomposer =
            QueryDecomposer::new(Arc::clone(&llm), config.decomposition, Arc::clone(&metrics));
        let retriever = Retriever::new(
            Arc::clone(&embedder),
            Arc::clone(&store),
            config.retrieval,
            Arc::clone(&metrics),
        );
        let synthesizer = Synthesizer::new(Arc::clone(&llm), Arc::clone(&metrics));
        let evaluator = Evaluator::new(llm, config.evaluation, Arc::clone(&metrics));

        Ok(Self {
            config,
            ingestion,
            decomposer,
            retriever,
            synthesizer,
            evaluator,
            store,
            metrics,
            state: RwLock::new(PipelineState::Idle),
            ingested: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> PipelineState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Index a batch of source URLs. Partial failure is normal; the report
    /// lists what was skipped. The pipeline is `Ready` once at least one
    /// document has landed in the store.
    pub async fn ingest(&self, urls: &[String]) -> Result<IngestionReport, IngestError> {
        self.set_state(PipelineState::Ingesting);
        let outcome = self.ingestion.ingest(urls).await;
        if let Ok(report) = &outcome {
            if report.documents_ingested > 0 {
                self.ingested.store(true, Ordering::Relaxed);
            }
        }
        self.set_rest_state();
        outcome
    }

    /// Answer one question: decompose, retrieve, synthesize. Decomposition
    /// failures degrade to querying with the whole question; an empty index
    /// degrades to the insufficient-evidence answer. The optional run
    /// deadline cancels the whole query.
    pub async fn ask(&self, question: &str) -> Result<AnswerReport, QueryError> {
        let cleaned = sanitize_question(question);
        if cleaned.is_empty() {
            return Err(QueryError::InvalidQuestion("question is empty".to_string()));
        }
        if cleaned.chars().count() > self.config.max_question_chars {
            return Err(QueryError::InvalidQuestion(format!(
                "question exceeds {} characters",
                self.config.max_question_chars
            )));
        }

        let started = Instant::now();
        let run = self.answer_run(&cleaned);
        let outcome = match self.config.run_timeout_ms {
            Some(budget_ms) => {
                match tokio::time::timeout(Duration::from_millis(budget_ms), run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        PipelineMetrics::bump(&self.metrics.runs_cancelled);
                        self.set_rest_state();
                        tracing::warn!(elapsed_ms, budget_ms, "query run cancelled");
                        return Err(QueryError::Cancelled { elapsed_ms });
                    }
                }
            }
            None => run.await,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.set_rest_state();

        match outcome {
            Ok((answer, context, degradations)) => {
                PipelineMetrics::bump(&self.metrics.questions_answered);
                PipelineMetrics::add(&self.metrics.answer_latency_ms, elapsed_ms);
                if !degradations.is_empty() {
                    PipelineMetrics::bump(&self.metrics.answers_degraded);
                }
                Ok(AnswerReport {
                    answer,
                    context,
                    degradations,
                    elapsed_ms,
                })
            }
            Err(err) => {
                PipelineMetrics::bump(&self.metrics.runs_failed);
                Err(err)
            }
        }
    }

    /// Score an answered question with the model-as-judge metrics.
    pub async fn evaluate(
        &self,
        report: &AnswerReport,
        gold_answer: Option<&str>,
    ) -> EvaluationReport {
        self.set_state(PipelineState::Evaluating);
        let evaluation = self
            .evaluator
            .evaluate(&report.answer, &report.context, gold_answer)
            .await;
        self.set_rest_state();
        evaluation
    }

    /// Probes the store and inspects recent failure counters. `Unhealthy`
    /// means the store is unreachable; `Degraded` means calls are going
    /// through but failing too often.
    pub async fn health_check(&self) -> HealthStatus {
        if let Err(err) = self.store.count().await {
            return HealthStatus {
                state: HealthState::Unhealthy,
                detail: format!("vector store unreachable: {err}"),
            };
        }

        let streak = self.metrics.store_failure_streak();
        if streak >= 3 {
            return HealthStatus {
                state: HealthState::Degraded,
                detail: format!("{streak} consecutive store failures"),
            };
        }

        let ratio = self.metrics.failure_ratio(self.config.health_min_samples);
        if ratio >= self.config.degraded_failure_ratio {
            return HealthStatus {
                state: HealthState::Degraded,
                detail: format!("recent failure ratio {ratio:.2}"),
            };
        }

        HealthStatus {
            state: HealthState::Healthy,
            detail: "all dependencies reachable".to_string(),
        }
    }

    async fn answer_run(
        &self,
        question: &str,
    ) -> Result<(SynthesizedAnswer, Vec<RetrievedChunk>, Vec<Degradation>), QueryError> {
        let parent_question_id = Uuid::new_v4();
        let mut degradations = Vec::new();

        self.set_state(PipelineState::Decomposing);
        let sub_queries = match self
            .decomposer
            .decompose(question, parent_question_id)
            .await
        {
            Ok(sub_queries) => sub_queries,
            Err(err) => {
                tracing::warn!(error = %err, "decomposition failed, querying with the whole question");
                degradations.push(Degradation::DecompositionFallback {
                    reason: err.to_string(),
                });
                vec![SubQuery {
                    text: question.to_string(),
                    parent_question_id,
                    index: 0,
                }]
            }
        };

        self.set_state(PipelineState::Retrieving);
        let retrieval = self.retriever.retrieve(&sub_queries).await?;
        degradations.extend(retrieval.degradations);

        self.set_state(PipelineState::Synthesizing);
        let synthesis = self
            .synthesizer
            .synthesize(question, &sub_queries, &retrieval.chunks)
            .await?;
        degradations.extend(synthesis.degradations);

        Ok((synthesis.answer, retrieval.chunks, degradations))
    }

    fn set_state(&self, state: PipelineState) {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = state;
    }

    /// `Ready` once something has been indexed, `Idle` before that.
    fn set_rest_state(&self) {
        if self.ingested.load(Ordering::Relaxed) {
            self.set_state(PipelineState::Ready);
        } else {
            self.set_state(PipelineState::Idle);
        }
    }
}

/// Control characters never reach a model prompt; newlines and tabs in a
/// pasted question become ordinary spaces.
fn sanitize_question(question: &str) -> String {
    let cleaned: String = question
        .chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::{ModelError, StoreError};
    use crate::llm::{Completion, CompletionConstraints, LlmClient};
    use crate::models::{Chunk, EmbeddedChunk};
    use crate::stores::MemoryVectorStore;
    use crate::synthesize::INSUFFICIENT_EVIDENCE;
    use crate::traits::ScoredHit;
    use async_trait::async_trait;
    use httpmock::prelude::*;

    const CHUNK_A: &str = "aaaa1111aaaa1111aaaa1111aaaa1111";
    const CHUNK_B: &str = "bbbb2222bbbb2222bbbb2222bbbb2222";

    /// Routes by system prompt: decomposer, synthesizer, and judges each
    /// use a distinctive one. Unrouted calls fail.
    struct RouterLlm {
        decompose_reply: Option<String>,
        synthesize_reply: Option<String>,
        judge_reply: Option<String>,
    }

    impl Default for RouterLlm {
        fn default() -> Self {
            Self {
                decompose_reply: Some(
                    "[\"What limits delivery?\", \"What are off-target effects?\"]".to_string(),
                ),
                synthesize_reply: Some(format!(
                    "Delivery caps efficiency [{}]. Off-target cuts add risk [{}].",
                    &CHUNK_A[..12],
                    &CHUNK_B[..12]
                )),
                judge_reply: Some("{\"score\": 0.5, \"rationale\": \"ok\"}".to_string()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for RouterLlm {
        async fn complete(
            &self,
            system: &str,
            _user: &str,
            _constraints: &CompletionConstraints,
        ) -> Result<Completion, ModelError> {
            let reply = if system.contains("split complex scientific questions") {
                &self.decompose_reply
            } else if system.contains("cite the passage") {
                &self.synthesize_reply
            } else if system.contains("strict evaluator") {
                &self.judge_reply
            } else {
                &None
            };
            match reply {
                Some(text) => Ok(Completion {
                    text: text.clone(),
                    total_tokens: Some(7),
                }),
                None => Err(ModelError::Empty {
                    service: "router".to_string(),
                }),
            }
        }
    }

    struct SlowLlm;

    #[async_trait]
    impl LlmClient for SlowLlm {
        async fn complete(
            &self,
            _system: &str,
            _user: &str,
            _constraints: &CompletionConstraints,
        ) -> Result<Completion, ModelError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Completion {
                text: "[]".to_string(),
                total_tokens: None,
            })
        }
    }

    struct DownStore;

    #[async_trait]
    impl VectorStore for DownStore {
        async fn upsert(&self, _records: &[EmbeddedChunk]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable {
                details: "connection refused".to_string(),
            })
        }

        async fn query(&self, _vector: &[f32], _k: usize) -> Result<Vec<ScoredHit>, StoreError> {
            Err(StoreError::Unavailable {
                details: "connection refused".to_string(),
            })
        }

        async fn count(&self) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable {
                details: "connection refused".to_string(),
            })
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            embedding_dimensions: 32,
            ..PipelineConfig::default()
        }
    }

    fn orchestrator(
        llm: RouterLlm,
        config: PipelineConfig,
    ) -> (
        PipelineOrchestrator<RouterLlm, CharacterNgramEmbedder, MemoryVectorStore>,
        Arc<CharacterNgramEmbedder>,
        Arc<MemoryVectorStore>,
    ) {
        let embedder = Arc::new(CharacterNgramEmbedder { dimensions: 32 });
        let store = Arc::new(MemoryVectorStore::new(32));
        let orchestrator = PipelineOrchestrator::new(
            config,
            Arc::new(llm),
            Arc::clone(&embedder),
            Arc::clone(&store),
        )
        .unwrap();
        (orchestrator, embedder, store)
    }

    async fn seed(store: &MemoryVectorStore, embedder: &CharacterNgramEmbedder) {
        let passages = [
            (CHUNK_A, "Delivery efficiency is the main limit."),
            (CHUNK_B, "Off-target cleavage raises safety risks."),
        ];
        let mut records = Vec::new();
        for (id, text) in passages {
            records.push(EmbeddedChunk {
                chunk: Chunk {
                    id: id.to_string(),
                    source_id: "doc-1".to_string(),
                    text: text.to_string(),
                    start_offset: 0,
                    overlap_with_prev: 0,
                },
                vector: embedder.embed(text).await.unwrap(),
            });
        }
        store.upsert(&records).await.unwrap();
    }

    #[tokio::test]
    async fn ask_returns_a_cited_answer() {
        let (orchestrator, embedder, store) = orchestrator(RouterLlm::default(), test_config());
        seed(&store, &embedder).await;

        let report = orchestrator
            .ask("What limits genome editing efficiency?")
            .await
            .unwrap();

        assert!(report.degradations.is_empty());
        assert_eq!(report.answer.citations.len(), 2);
        assert_eq!(report.answer.citations[0].chunk_id, CHUNK_A);
        assert_eq!(report.answer.sub_queries.len(), 2);
        assert!(!report.context.is_empty());

        let snapshot = orchestrator.metrics().snapshot();
        assert_eq!(snapshot.questions_answered, 1);
        assert_eq!(snapshot.answers_degraded, 0);
    }

    #[tokio::test]
    async fn decomposition_failure_degrades_to_the_whole_question() {
        let llm = RouterLlm {
            decompose_reply: None,
            ..RouterLlm::default()
        };
        let (orchestrator, embedder, store) = orchestrator(llm, test_config());
        seed(&store, &embedder).await;

        let report = orchestrator.ask("What limits editing?").await.unwrap();

        assert!(report
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::DecompositionFallback { .. })));
        assert_eq!(report.answer.sub_queries.len(), 1);
        assert_eq!(report.answer.sub_queries[0].text, "What limits editing?");
        assert_eq!(orchestrator.metrics().snapshot().answers_degraded, 1);
    }

    #[tokio::test]
    async fn empty_index_reports_insufficient_evidence() {
        let (orchestrator, _embedder, _store) = orchestrator(RouterLlm::default(), test_config());

        let report = orchestrator.ask("What limits editing?").await.unwrap();

        assert_eq!(report.answer.answer_text, INSUFFICIENT_EVIDENCE);
        assert!(report.answer.citations.is_empty());
        assert!(report
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::EmptyContext)));
    }

    #[test]
    fn questions_are_sanitized_before_prompting() {
        assert_eq!(
            sanitize_question("  what\tcauses\n\nlong covid?\u{7} "),
            "what causes long covid?"
        );
        assert_eq!(sanitize_question("\u{0}\u{1}"), "");
    }

    #[tokio::test]
    async fn invalid_questions_are_rejected() {
        let config = PipelineConfig {
            max_question_chars: 16,
            ..test_config()
        };
        let (orchestrator, _embedder, _store) = orchestrator(RouterLlm::default(), config);

        assert!(matches!(
            orchestrator.ask("   ").await,
            Err(QueryError::InvalidQuestion(_))
        ));
        assert!(matches!(
            orchestrator.ask("a question far over the limit").await,
            Err(QueryError::InvalidQuestion(_))
        ));
    }

    #[tokio::test]
    async fn slow_runs_are_cancelled_at_the_deadline() {
        let config = PipelineConfig {
            run_timeout_ms: Some(25),
            embedding_dimensions: 32,
            ..PipelineConfig::default()
        };
        let orchestrator = PipelineOrchestrator::new(
            config,
            Arc::new(SlowLlm),
            Arc::new(CharacterNgramEmbedder { dimensions: 32 }),
            Arc::new(MemoryVectorStore::new(32)),
        )
        .unwrap();

        let result = orchestrator.ask("Why is the sky blue?").await;

        assert!(matches!(result, Err(QueryError::Cancelled { .. })));
        assert_eq!(orchestrator.metrics().snapshot().runs_cancelled, 1);
    }

    #[tokio::test]
    async fn ingestion_readies_the_pipeline() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/paper");
                then.status(200)
                    .header("content-type", "text/plain")
                    .body("Delivery efficiency is the main limit on editing.");
            })
            .await;

        let mut config = test_config();
        config.fetch.allowed_schemes = vec!["http".to_string()];
        config.fetch.allowed_domains = vec![server.host()];
        config.fetch.per_host_min_interval_ms = 0;

        let (orchestrator, _embedder, store) = orchestrator(RouterLlm::default(), config);
        assert_eq!(orchestrator.state(), PipelineState::Idle);

        let report = orchestrator.ingest(&[server.url("/paper")]).await.unwrap();
        assert_eq!(report.documents_ingested, 1);
        assert_eq!(orchestrator.state(), PipelineState::Ready);
        assert_eq!(store.count().await.unwrap(), 1);

        orchestrator.ask("What limits editing?").await.unwrap();
        assert_eq!(orchestrator.state(), PipelineState::Ready);
    }

    #[tokio::test]
    async fn evaluation_scores_an_answer_report() {
        let (orchestrator, embedder, store) = orchestrator(RouterLlm::default(), test_config());
        seed(&store, &embedder).await;

        let report = orchestrator.ask("What limits editing?").await.unwrap();
        let evaluation = orchestrator.evaluate(&report, None).await;

        assert_eq!(evaluation.scores.len(), 3);
        assert!((evaluation.composite.unwrap() - 0.5).abs() < 1e-9);
        assert!(orchestrator.metrics().snapshot().judge_calls >= 3);
    }

    #[tokio::test]
    async fn health_tracks_store_and_failure_ratio() {
        let (orchestrator, _embedder, _store) = orchestrator(RouterLlm::default(), test_config());
        assert_eq!(orchestrator.health_check().await.state, HealthState::Healthy);

        for _ in 0..3 {
            PipelineMetrics::bump(&orchestrator.metrics().llm_calls);
        }
        PipelineMetrics::bump(&orchestrator.metrics().llm_calls);
        PipelineMetrics::bump(&orchestrator.metrics().llm_failures);
        assert_eq!(
            orchestrator.health_check().await.state,
            HealthState::Degraded
        );

        let down = PipelineOrchestrator::new(
            test_config(),
            Arc::new(RouterLlm::default()),
            Arc::new(CharacterNgramEmbedder { dimensions: 32 }),
            Arc::new(DownStore),
        )
        .unwrap();
        assert_eq!(down.health_check().await.state, HealthState::Unhealthy);
    }
}

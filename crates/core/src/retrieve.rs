use crate::config::RetrievalOptions;
use crate::embeddings::EmbeddingClient;
use crate::error::{QueryError, StoreError};
use crate::metrics::PipelineMetrics;
use crate::models::{Degradation, RetrievedChunk, SubQuery};
use crate::traits::{ScoredHit, VectorStore};
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

/// Merged context for one question, plus the sub-query failures that were
/// tolerated while building it.
#[derive(Debug)]
pub struct RetrievalOutcome {
    pub chunks: Vec<RetrievedChunk>,
    pub degradations: Vec<Degradation>,
}

/// Embeds each sub-query and queries the store for all of them
/// concurrently, then merges the result lists: one entry per chunk id,
/// maximum observed score, provenance of every sub-query that hit it.
pub struct Retriever<E, S> {
    embedder: Arc<E>,
    store: Arc<S>,
    options: RetrievalOptions,
    metrics: Arc<PipelineMetrics>,
}

impl<E: EmbeddingClient, S: VectorStore> Retriever<E, S> {
    pub fn new(
        embedder: Arc<E>,
        store: Arc<S>,
        options: RetrievalOptions,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            embedder,
            store,
            options,
            metrics,
        }
    }

    pub async fn retrieve(
        &self,
        sub_queries: &[SubQuery],
    ) -> Result<RetrievalOutcome, QueryError> {
        let tasks = sub_queries
            .iter()
            .map(|sub| async move { (sub.index, self.retrieve_one(sub).await) });
        let results = futures::future::join_all(tasks).await;

        let mut merged: HashMap<String, RetrievedChunk> = HashMap::new();
        let mut degradations = Vec::new();
        let mut failures = 0usize;

        for (index, result) in results {
            match result {
                Ok(hits) => {
                    for hit in hits {
                        merge_hit(&mut merged, hit, index);
                    }
                }
                // Embedding/model drift breaks every sub-query the same way;
                // surface it instead of reporting a blanket failure.
                Err(QueryError::Store(StoreError::DimensionMismatch { expected, actual })) => {
                    return Err(QueryError::Store(StoreError::DimensionMismatch {
                        expected,
                        actual,
                    }));
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(sub_query = index, error = %err, "sub-query retrieval failed");
                    degradations.push(Degradation::SubQueryFailed {
                        index,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if !sub_queries.is_empty() && failures == sub_queries.len() {
            return Err(QueryError::AllSubQueriesFailed(failures));
        }

        let mut chunks: Vec<RetrievedChunk> = merged.into_values().collect();
        for chunk in &mut chunks {
            chunk.hit_by.sort_unstable();
        }
        chunks.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        chunks.truncate(self.options.max_context_chunks);

        Ok(RetrievalOutcome {
            chunks,
            degradations,
        })
    }

    async fn retrieve_one(&self, sub: &SubQuery) -> Result<Vec<ScoredHit>, QueryError> {
        PipelineMetrics::bump(&self.metrics.embedding_calls);
        let vector = self.embedder.embed(&sub.text).await.map_err(|err| {
            PipelineMetrics::bump(&self.metrics.embedding_failures);
            QueryError::Model(err)
        })?;

        PipelineMetrics::bump(&self.metrics.store_queries);
        match self.store.query(&vector, self.options.k_per_subquery).await {
            Ok(hits) => {
                self.metrics.record_store_outcome(true);
                Ok(hits)
            }
            Err(err) => {
                self.metrics.record_store_outcome(false);
                Err(QueryError::Store(err))
            }
        }
    }
}

fn merge_hit(merged: &mut HashMap<String, RetrievedChunk>, hit: ScoredHit, index: usize) {
    match merged.entry(hit.chunk_id) {
        Entry::Occupied(mut entry) => {
            let existing = entry.get_mut();
            if hit.score > existing.score {
                existing.score = hit.score;
            }
            if !existing.hit_by.contains(&index) {
                existing.hit_by.push(index);
            }
        }
        Entry::Vacant(entry) => {
            let chunk_id = entry.key().clone();
            entry.insert(RetrievedChunk {
                chunk_id,
                text: hit.text,
                score: hit.score,
                hit_by: vec![index],
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::models::{Chunk, EmbeddedChunk};
    use crate::stores::MemoryVectorStore;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct FakeEmbedder {
        dimensions: usize,
        vectors: HashMap<String, Vec<f32>>,
    }

    #[async_trait]
    impl EmbeddingClient for FakeEmbedder {
        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
            self.vectors
                .get(text)
                .cloned()
                .ok_or_else(|| ModelError::Empty {
                    service: "fake-embeddings".to_string(),
                })
        }
    }

    fn sub(text: &str, index: usize) -> SubQuery {
        SubQuery {
            text: text.to_string(),
            parent_question_id: Uuid::nil(),
            index,
        }
    }

    fn record(id: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: Chunk {
                id: id.to_string(),
                source_id: "doc-1".to_string(),
                text: format!("text {id}"),
                start_offset: 0,
                overlap_with_prev: 0,
            },
            vector,
        }
    }

    async fn retriever(
        dimensions: usize,
        vectors: &[(&str, Vec<f32>)],
        records: Vec<EmbeddedChunk>,
        options: RetrievalOptions,
    ) -> (Retriever<FakeEmbedder, MemoryVectorStore>, Arc<PipelineMetrics>) {
        let store = Arc::new(MemoryVectorStore::new(dimensions));
        store.upsert(&records).await.unwrap();
        let embedder = Arc::new(FakeEmbedder {
            dimensions,
            vectors: vectors
                .iter()
                .map(|(text, vector)| (text.to_string(), vector.clone()))
                .collect(),
        });
        let metrics = Arc::new(PipelineMetrics::new());
        (
            Retriever::new(embedder, store, options, Arc::clone(&metrics)),
            metrics,
        )
    }

    #[tokio::test]
    async fn results_merge_with_max_score_and_provenance() {
        let (retriever, _) = retriever(
            2,
            &[("q0", vec![1.0, 0.0]), ("q1", vec![0.6, 0.8])],
            vec![record("a", vec![1.0, 0.0])],
            RetrievalOptions {
                k_per_subquery: 5,
                max_context_chunks: 8,
            },
        )
        .await;

        let outcome = retriever
            .retrieve(&[sub("q0", 0), sub("q1", 1)])
            .await
            .unwrap();

        assert_eq!(outcome.chunks.len(), 1);
        let chunk = &outcome.chunks[0];
        assert_eq!(chunk.chunk_id, "a");
        assert!((chunk.score - 1.0).abs() < 1e-9, "max score wins");
        assert_eq!(chunk.hit_by, vec![0, 1]);
    }

    #[tokio::test]
    async fn merged_output_is_sorted_with_id_tie_break() {
        let (retriever, _) = retriever(
            2,
            &[("q0", vec![1.0, 0.0]), ("q1", vec![0.0, 1.0])],
            vec![
                record("b", vec![1.0, 0.0]),
                record("a", vec![0.0, 1.0]),
                record("c", vec![0.6, 0.8]),
            ],
            RetrievalOptions {
                k_per_subquery: 3,
                max_context_chunks: 8,
            },
        )
        .await;

        let outcome = retriever
            .retrieve(&[sub("q0", 0), sub("q1", 1)])
            .await
            .unwrap();

        let ids: Vec<&str> = outcome
            .chunks
            .iter()
            .map(|chunk| chunk.chunk_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn context_is_capped_at_the_configured_maximum() {
        let mut records = Vec::new();
        for i in 0..10 {
            let mut vector = vec![0.0f32; 10];
            vector[i] = 1.0;
            records.push(record(&format!("c{i}"), vector));
        }
        let spread = |targets: [usize; 5]| {
            let mut vector = vec![0.0f32; 10];
            for (rank, target) in targets.iter().enumerate() {
                vector[*target] = 1.0 - rank as f32 * 0.1;
            }
            vector
        };
        let (retriever, _) = retriever(
            10,
            &[
                ("q0", spread([0, 1, 2, 3, 4])),
                ("q1", spread([3, 4, 5, 6, 7])),
                ("q2", spread([5, 6, 7, 8, 9])),
            ],
            records,
            RetrievalOptions {
                k_per_subquery: 5,
                max_context_chunks: 8,
            },
        )
        .await;

        let outcome = retriever
            .retrieve(&[sub("q0", 0), sub("q1", 1), sub("q2", 2)])
            .await
            .unwrap();

        assert_eq!(outcome.chunks.len(), 8);
        for pair in outcome.chunks.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn failed_subquery_is_excluded_but_not_fatal() {
        let (retriever, metrics) = retriever(
            2,
            &[("good", vec![1.0, 0.0])],
            vec![record("a", vec![1.0, 0.0])],
            RetrievalOptions::default(),
        )
        .await;

        let outcome = retriever
            .retrieve(&[sub("good", 0), sub("unknown", 1)])
            .await
            .unwrap();

        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.degradations.len(), 1);
        assert!(matches!(
            outcome.degradations[0],
            Degradation::SubQueryFailed { index: 1, .. }
        ));
        assert_eq!(metrics.snapshot().embedding_failures, 1);
    }

    #[tokio::test]
    async fn retrieval_fails_only_when_every_subquery_fails() {
        let (retriever, _) = retriever(2, &[], vec![], RetrievalOptions::default()).await;

        let err = retriever
            .retrieve(&[sub("unknown-a", 0), sub("unknown-b", 1)])
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::AllSubQueriesFailed(2)));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_surfaced_not_swallowed() {
        let (retriever, _) = retriever(
            4,
            &[("q0", vec![1.0, 0.0])],
            vec![],
            RetrievalOptions::default(),
        )
        .await;

        let err = retriever.retrieve(&[sub("q0", 0)]).await.unwrap_err();
        assert!(matches!(
            err,
            QueryError::Store(StoreError::DimensionMismatch { .. })
        ));
    }
}

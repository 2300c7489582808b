use crate::error::StoreError;
use crate::models::EmbeddedChunk;
use crate::traits::{ScoredHit, VectorStore};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process store keyed by chunk id. Backs tests and offline runs with the
/// same upsert/query semantics as the remote backends: re-submitting an id
/// replaces the record, queries rank by cosine similarity with ties broken
/// by id.
pub struct MemoryVectorStore {
    dimensions: usize,
    records: RwLock<HashMap<String, EmbeddedChunk>>,
}

impl MemoryVectorStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            records: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, records: &[EmbeddedChunk]) -> Result<(), StoreError> {
        for record in records {
            if record.vector.len() != self.dimensions {
                return Err(StoreError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: record.vector.len(),
                });
            }
        }

        let mut store = self.records.write().await;
        for record in records {
            store.insert(record.chunk.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredHit>, StoreError> {
        if vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }

        let store = self.records.read().await;
        let mut hits: Vec<ScoredHit> = store
            .values()
            .map(|record| ScoredHit {
                chunk_id: record.chunk.id.clone(),
                source_id: record.chunk.source_id.clone(),
                text: record.chunk.text.clone(),
                score: cosine_similarity(vector, &record.vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().await.len())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

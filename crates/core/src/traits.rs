use crate::error::StoreError;
use crate::models::EmbeddedChunk;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One nearest-neighbor match from the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredHit {
    pub chunk_id: String,
    pub source_id: String,
    pub text: String,
    pub score: f64,
}

/// Capability interface over the backing vector index. Upsert is keyed by
/// chunk id, so re-ingesting an unchanged corpus replaces records in place
/// instead of appending. Query returns at most `k` hits by descending cosine
/// similarity, ties broken by ascending chunk id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, records: &[EmbeddedChunk]) -> Result<(), StoreError>;

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredHit>, StoreError>;

    /// Record count; cheap enough for health probes and idempotence checks.
    async fn count(&self) -> Result<usize, StoreError>;
}

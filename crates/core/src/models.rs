use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A fetched and cleaned source page. Immutable once built; re-fetching the
/// same URL produces a document with the same id, superseding the old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub url: String,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
}

impl SourceDocument {
    pub fn new(url: impl Into<String>, text: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: document_id(&url),
            url,
            text: text.into(),
            fetched_at: Utc::now(),
        }
    }
}

/// Stable document id derived from the source URL alone, so a re-fetch
/// supersedes rather than duplicates.
pub fn document_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A bounded, overlapping slice of one document; the unit of indexing and
/// retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source_id: String,
    pub text: String,
    pub start_offset: usize,
    pub overlap_with_prev: usize,
}

impl Chunk {
    /// Chunk ids hash the source id, the position, and the normalized text,
    /// which is what makes re-ingestion of unchanged sources an upsert
    /// no-op.
    pub fn make_id(source_id: &str, start_offset: usize, normalized_text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update(start_offset.to_le_bytes());
        hasher.update(normalized_text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A chunk paired with its embedding vector, ready for upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// One atomic sub-question produced by decomposing a complex question.
/// Ephemeral: lives for a single query-pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuery {
    pub text: String,
    pub parent_question_id: Uuid,
    pub index: usize,
}

/// A chunk returned by retrieval, deduplicated across sub-queries. `hit_by`
/// records which sub-query indices retrieved it, in decomposition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub text: String,
    pub score: f64,
    pub hit_by: Vec<usize>,
}

/// Resolution of one inline citation marker to the chunk it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub marker: String,
    pub chunk_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizedAnswer {
    pub question: String,
    pub sub_queries: Vec<SubQuery>,
    pub context_chunk_ids: Vec<String>,
    pub answer_text: String,
    pub citations: Vec<Citation>,
}

/// A fault the pipeline recovered from instead of aborting the run. Every
/// entrypoint reports these alongside its best-effort output so callers can
/// tell clean success from degraded success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    DecompositionFallback { reason: String },
    SubQueryFailed { index: usize, reason: String },
    GroundingViolation { marker: String },
    EmptyContext,
    JudgeClamped { metric: String, raw: f64 },
    JudgeUnparseable { metric: String, reason: String },
}

use crate::error::StoreError;
use crate::models::EmbeddedChunk;
use crate::traits::{ScoredHit, VectorStore};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::cmp::Ordering;
use uuid::Uuid;

/// Qdrant-backed store. Point ids are UUIDv5 digests of the chunk id, so
/// re-upserting an unchanged chunk lands on the same point and the index
/// stays duplicate-free across re-ingestion runs.
pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    dimensions: usize,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            collection: collection.into(),
            client: Client::new(),
            dimensions,
        }
    }

    /// Creates the collection if missing; if it exists, verifies the stored
    /// vector size still matches the configured embedding dimensionality.
    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let url = format!("{}/collections/{}", self.endpoint, self.collection);
        let response = self.client.get(&url).send().await.map_err(transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            let created = self
                .client
                .put(&url)
                .json(&json!({
                    "vectors": { "size": self.dimensions, "distance": "Cosine" },
                }))
                .send()
                .await
                .map_err(transport)?;
            if !created.status().is_success() {
                return Err(backend_status(created.status()));
            }
            return Ok(());
        }

        if !response.status().is_success() {
            return Err(backend_status(response.status()));
        }

        let parsed: Value = response.json().await?;
        if let Some(size) = parsed
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
        {
            if size as usize != self.dimensions {
                return Err(StoreError::DimensionMismatch {
                    expected: size as usize,
                    actual: self.dimensions,
                });
            }
        }
        Ok(())
    }

    fn point_id(chunk_id: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string()
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, records: &[EmbeddedChunk]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut points = Vec::with_capacity(records.len());
        for record in records {
            if record.vector.len() != self.dimensions {
                return Err(StoreError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: record.vector.len(),
                });
            }
            points.push(json!({
                "id": Self::point_id(&record.chunk.id),
                "vector": record.vector,
                "payload": {
                    "chunk_id": record.chunk.id,
                    "source_id": record.chunk.source_id,
                    "text": record.chunk.text,
                    "start_offset": record.chunk.start_offset,
                    "overlap_with_prev": record.chunk.overlap_with_prev,
                },
            }));
        }

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(backend_status(response.status()));
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

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.endpoint, self.collection
            ))
            .json(&json!({
                "vector": vector,
                "limit": k,
                "with_payload": true,
            }))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(backend_status(response.status()));
        }

        let parsed: Value = response.json().await?;
        Ok(parse_hits(&parsed))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/count",
                self.endpoint, self.collection
            ))
            .json(&json!({ "exact": true }))
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(backend_status(response.status()));
        }

        let parsed: Value = response.json().await?;
        let count = parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::BackendResponse {
                backend: "qdrant".to_string(),
                details: "count response missing /result/count".to_string(),
            })?;
        Ok(count as usize)
    }
}

/// Same ordering contract as the in-memory store: descending score, ties
/// broken by chunk id.
fn parse_hits(parsed: &Value) -> Vec<ScoredHit> {
    let raw = parsed
        .pointer("/result")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut hits = Vec::with_capacity(raw.len());
    for hit in raw {
        let chunk_id = hit
            .pointer("/payload/chunk_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if chunk_id.is_empty() {
            continue;
        }
        hits.push(ScoredHit {
            chunk_id,
            source_id: hit
                .pointer("/payload/source_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            text: hit
                .pointer("/payload/text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0),
        });
    }

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits
}

fn transport(err: reqwest::Error) -> StoreError {
    if err.is_connect() || err.is_timeout() {
        StoreError::Unavailable {
            details: err.to_string(),
        }
    } else {
        StoreError::Http(err)
    }
}

fn backend_status(status: StatusCode) -> StoreError {
    if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::BAD_GATEWAY {
        StoreError::Unavailable {
            details: format!("qdrant returned {status}"),
        }
    } else {
        StoreError::BackendResponse {
            backend: "qdrant".to_string(),
            details: status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable_per_chunk_id() {
        let first = QdrantStore::point_id("abc123");
        let second = QdrantStore::point_id("abc123");
        let other = QdrantStore::point_id("abc124");
        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn search_hits_are_parsed_and_tie_broken_by_id() {
        let body = json!({
            "result": [
                {
                    "id": "p2",
                    "score": 0.9,
                    "payload": {"chunk_id": "bbb", "source_id": "s", "text": "two"},
                },
                {
                    "id": "p1",
                    "score": 0.9,
                    "payload": {"chunk_id": "aaa", "source_id": "s", "text": "one"},
                },
                {
                    "id": "p3",
                    "score": 0.95,
                    "payload": {"chunk_id": "ccc", "source_id": "s", "text": "three"},
                },
            ],
        });

        let hits = parse_hits(&body);
        let ids: Vec<&str> = hits.iter().map(|hit| hit.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["ccc", "aaa", "bbb"]);
    }

    #[test]
    fn hits_without_chunk_ids_are_dropped() {
        let body = json!({
            "result": [
                {"id": "p1", "score": 0.5, "payload": {}},
            ],
        });
        assert!(parse_hits(&body).is_empty());
    }
}

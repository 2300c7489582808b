use crate::error::ModelError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// Maps text to fixed-length vectors. Injected wherever embeddings are
/// needed so the pipeline runs against a deterministic local implementation
/// in tests.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Hashed character trigram embedder: deterministic, offline, normalized to
/// unit length. The default for tests and air-gapped runs.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingClient for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        Ok(self.embed_sync(text))
    }
}

/// Client for OpenAI-compatible `/embeddings` endpoints. Batches requests and
/// retries 429/5xx/transport failures with exponential backoff.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
    max_retries: u32,
}

impl HttpEmbeddingClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|err| ModelError::Malformed {
                service: "embeddings".to_string(),
                details: format!("invalid api key header: {err}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.into(),
            dimensions,
            batch_size: 64,
            max_retries: 3,
        })
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn should_retry_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_request()
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_millis(500 * (1u64 << attempt.min(5)))
    }

    async fn post_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut attempt = 0u32;
        loop {
            let request = EmbeddingRequest {
                model: &self.model,
                input: inputs,
                dimensions: Some(self.dimensions),
            };
            let response = self.client.post(&self.endpoint).json(&request).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let mut parsed: EmbeddingResponse =
                            resp.json().await.map_err(|err| ModelError::Malformed {
                                service: "embeddings".to_string(),
                                details: err.to_string(),
                            })?;
                        parsed.data.sort_by_key(|entry| entry.index);
                        if parsed.data.len() != inputs.len() {
                            return Err(ModelError::Malformed {
                                service: "embeddings".to_string(),
                                details: format!(
                                    "{} embeddings returned for {} inputs",
                                    parsed.data.len(),
                                    inputs.len()
                                ),
                            });
                        }
                        return Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect());
                    }

                    let body = resp.text().await.unwrap_or_default();
                    if Self::should_retry_status(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(Self::backoff(attempt)).await;
                        continue;
                    }
                    return Err(ModelError::Status {
                        service: "embeddings".to_string(),
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    if Self::should_retry_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        tokio::time::sleep(Self::backoff(attempt)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let batch = [text.to_string()];
        let mut vectors = self.post_batch(&batch).await?;
        vectors.pop().ok_or_else(|| ModelError::Empty {
            service: "embeddings".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for window in texts.chunks(self.batch_size) {
            vectors.extend(self.post_batch(window).await?);
        }
        Ok(vectors)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

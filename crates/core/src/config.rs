use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Chunking tunables. `overlap_chars < chunk_chars` is enforced by
/// [`PipelineConfig::validate`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkingOptions {
    pub chunk_chars: usize,
    pub overlap_chars: usize,
    pub min_chunk_chars: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            chunk_chars: 1_200,
            overlap_chars: 120,
            min_chunk_chars: 80,
        }
    }
}

/// Bounds on outbound fetching: concurrency, retries, politeness, and the
/// source allow-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOptions {
    pub max_in_flight: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub per_host_min_interval_ms: u64,
    pub allowed_schemes: Vec<String>,
    pub allowed_domains: Vec<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            max_attempts: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 5_000,
            request_timeout_ms: 30_000,
            per_host_min_interval_ms: 250,
            allowed_schemes: vec!["https".to_string()],
            allowed_domains: vec![
                "arxiv.org".to_string(),
                "www.ncbi.nlm.nih.gov".to_string(),
                "pubmed.ncbi.nlm.nih.gov".to_string(),
                "www.biorxiv.org".to_string(),
            ],
        }
    }
}

impl FetchOptions {
    /// Allow-list check; runs before any network call. A domain entry also
    /// admits its subdomains.
    pub fn check_allowed(&self, url: &Url) -> Result<(), String> {
        if !self
            .allowed_schemes
            .iter()
            .any(|scheme| scheme == url.scheme())
        {
            return Err(format!("scheme '{}' not allowed", url.scheme()));
        }

        let host = url.host_str().unwrap_or_default();
        let allowed = self.allowed_domains.iter().any(|domain| {
            host == domain || host.ends_with(&format!(".{domain}"))
        });
        if !allowed {
            return Err(format!("domain '{host}' not allow-listed"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrievalOptions {
    pub k_per_subquery: usize,
    pub max_context_chunks: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            k_per_subquery: 5,
            max_context_chunks: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecompositionOptions {
    pub min_subqueries: usize,
    pub max_subqueries: usize,
    pub max_subquery_chars: usize,
}

impl Default for DecompositionOptions {
    fn default() -> Self {
        Self {
            min_subqueries: 2,
            max_subqueries: 5,
            max_subquery_chars: 300,
        }
    }
}

/// Per-metric composite weights; normalized over whichever metrics actually
/// produced a usable score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EvaluationOptions {
    pub precision_weight: f64,
    pub faithfulness_weight: f64,
    pub relevance_weight: f64,
    pub correctness_weight: f64,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            precision_weight: 1.0,
            faithfulness_weight: 1.0,
            relevance_weight: 1.0,
            correctness_weight: 1.0,
        }
    }
}

/// All pipeline tunables. Loaded once per process, immutable afterwards; no
/// stage hardcodes any of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub chunking: ChunkingOptions,
    pub fetch: FetchOptions,
    pub retrieval: RetrievalOptions,
    pub decomposition: DecompositionOptions,
    pub evaluation: EvaluationOptions,
    pub embedding_dimensions: usize,
    pub max_question_chars: usize,
    pub run_timeout_ms: Option<u64>,
    pub degraded_failure_ratio: f64,
    pub health_min_samples: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingOptions::default(),
            fetch: FetchOptions::default(),
            retrieval: RetrievalOptions::default(),
            decomposition: DecompositionOptions::default(),
            evaluation: EvaluationOptions::default(),
            embedding_dimensions: 128,
            max_question_chars: 2_000,
            run_timeout_ms: None,
            degraded_failure_ratio: 0.25,
            health_min_samples: 4,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunking.chunk_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_chars must be positive".to_string(),
            ));
        }
        if self.chunking.overlap_chars >= self.chunking.chunk_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk size {}",
                self.chunking.overlap_chars, self.chunking.chunk_chars
            )));
        }
        if self.fetch.max_in_flight == 0 {
            return Err(IngestError::InvalidArgument(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.fetch.max_attempts == 0 {
            return Err(IngestError::InvalidArgument(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retrieval.k_per_subquery == 0 || self.retrieval.max_context_chunks == 0 {
            return Err(IngestError::InvalidArgument(
                "retrieval caps must be positive".to_string(),
            ));
        }
        if self.decomposition.min_subqueries < 2
            || self.decomposition.max_subqueries < self.decomposition.min_subqueries
        {
            return Err(IngestError::InvalidArgument(
                "decomposition bounds must satisfy 2 <= min <= max".to_string(),
            ));
        }
        if self.embedding_dimensions == 0 {
            return Err(IngestError::InvalidArgument(
                "embedding_dimensions must be positive".to_string(),
            ));
        }
        if self.max_question_chars == 0 {
            return Err(IngestError::InvalidArgument(
                "max_question_chars must be positive".to_string(),
            ));
        }
        let weights = [
            self.evaluation.precision_weight,
            self.evaluation.faithfulness_weight,
            self.evaluation.relevance_weight,
            self.evaluation.correctness_weight,
        ];
        if weights.iter().any(|weight| *weight < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(IngestError::InvalidArgument(
                "evaluation weights must be non-negative with a positive sum".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PipelineConfig::default().validate().expect("default config");
    }

    #[test]
    fn overlap_must_stay_below_chunk_size() {
        let mut config = PipelineConfig::default();
        config.chunking.overlap_chars = config.chunking.chunk_chars;
        assert!(config.validate().is_err());
    }

    #[test]
    fn allow_list_admits_listed_domain_and_subdomains() {
        let options = FetchOptions::default();
        let listed = Url::parse("https://arxiv.org/abs/1234.5678").unwrap();
        assert!(options.check_allowed(&listed).is_ok());

        let subdomain = Url::parse("https://export.arxiv.org/abs/1234.5678").unwrap();
        assert!(options.check_allowed(&subdomain).is_ok());
    }

    #[test]
    fn allow_list_rejects_unlisted_domain_and_scheme() {
        let options = FetchOptions::default();
        let phish = Url::parse("http://evil.example/phish").unwrap();
        assert!(options.check_allowed(&phish).is_err());

        let wrong_scheme = Url::parse("http://arxiv.org/abs/1").unwrap();
        assert!(options.check_allowed(&wrong_scheme).is_err());
    }
}

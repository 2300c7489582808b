use thiserror::Error;

/// Failures talking to the embedding or language-model service.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("malformed {service} response: {details}")]
    Malformed { service: String, details: String },

    #[error("{service} response had no content")]
    Empty { service: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {details}")]
    Unavailable { details: String },

    #[error("vector dimension mismatch: store holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Dimension drift means the embedding config no longer matches the
    /// index; retrying cannot fix it.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::DimensionMismatch { .. })
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid source {url}: {reason}")]
    InvalidSource { url: String, reason: String },

    #[error("gave up on {url} after {attempts} attempts: {last_error}")]
    Transient {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("extraction failed for {url}: {reason}")]
    Extract { url: String, reason: String },

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid question: {0}")]
    InvalidQuestion(String),

    #[error("decomposition failed: {0}")]
    Decomposition(String),

    #[error("all {0} sub-queries failed during retrieval")]
    AllSubQueriesFailed(usize),

    #[error("run cancelled after {elapsed_ms}ms")]
    Cancelled { elapsed_ms: u64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

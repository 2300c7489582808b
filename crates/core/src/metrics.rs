use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, reset only on process restart. Every stage bumps
/// these directly with relaxed atomics; readers take a [`MetricsSnapshot`].
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub fetch_attempts: AtomicU64,
    pub fetch_retries: AtomicU64,
    pub fetch_successes: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub fetch_latency_ms: AtomicU64,
    pub documents_ingested: AtomicU64,
    pub chunks_indexed: AtomicU64,
    pub embedding_calls: AtomicU64,
    pub embedding_failures: AtomicU64,
    pub store_upserts: AtomicU64,
    pub store_queries: AtomicU64,
    pub store_failures: AtomicU64,
    pub llm_calls: AtomicU64,
    pub llm_failures: AtomicU64,
    pub llm_tokens: AtomicU64,
    pub judge_calls: AtomicU64,
    pub judge_parse_failures: AtomicU64,
    pub questions_answered: AtomicU64,
    pub answers_degraded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_cancelled: AtomicU64,
    pub answer_latency_ms: AtomicU64,
    store_failure_streak: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Consecutive store failures since the last successful store call.
    /// Health checks read this; any store success resets it.
    pub fn record_store_outcome(&self, ok: bool) {
        if ok {
            self.store_failure_streak.store(0, Ordering::Relaxed);
        } else {
            Self::bump(&self.store_failures);
            Self::bump(&self.store_failure_streak);
        }
    }

    pub fn store_failure_streak(&self) -> u64 {
        self.store_failure_streak.load(Ordering::Relaxed)
    }

    /// Share of failed operations across all external calls. Returns 0.0
    /// until `min_samples` operations have been observed so a cold process
    /// does not report as degraded.
    pub fn failure_ratio(&self, min_samples: u64) -> f64 {
        let ops = self.fetch_attempts.load(Ordering::Relaxed)
            + self.embedding_calls.load(Ordering::Relaxed)
            + self.store_upserts.load(Ordering::Relaxed)
            + self.store_queries.load(Ordering::Relaxed)
            + self.llm_calls.load(Ordering::Relaxed);
        if ops < min_samples.max(1) {
            return 0.0;
        }
        let failures = self.fetch_failures.load(Ordering::Relaxed)
            + self.embedding_failures.load(Ordering::Relaxed)
            + self.store_failures.load(Ordering::Relaxed)
            + self.llm_failures.load(Ordering::Relaxed);
        failures as f64 / ops as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            fetch_attempts: load(&self.fetch_attempts),
            fetch_retries: load(&self.fetch_retries),
            fetch_successes: load(&self.fetch_successes),
            fetch_failures: load(&self.fetch_failures),
            fetch_latency_ms: load(&self.fetch_latency_ms),
            documents_ingested: load(&self.documents_ingested),
            chunks_indexed: load(&self.chunks_indexed),
            embedding_calls: load(&self.embedding_calls),
            embedding_failures: load(&self.embedding_failures),
            store_upserts: load(&self.store_upserts),
            store_queries: load(&self.store_queries),
            store_failures: load(&self.store_failures),
            llm_calls: load(&self.llm_calls),
            llm_failures: load(&self.llm_failures),
            llm_tokens: load(&self.llm_tokens),
            judge_calls: load(&self.judge_calls),
            judge_parse_failures: load(&self.judge_parse_failures),
            questions_answered: load(&self.questions_answered),
            answers_degraded: load(&self.answers_degraded),
            runs_failed: load(&self.runs_failed),
            runs_cancelled: load(&self.runs_cancelled),
            answer_latency_ms: load(&self.answer_latency_ms),
        }
    }
}

/// Point-in-time copy of the counters, serializable for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub fetch_attempts: u64,
    pub fetch_retries: u64,
    pub fetch_successes: u64,
    pub fetch_failures: u64,
    pub fetch_latency_ms: u64,
    pub documents_ingested: u64,
    pub chunks_indexed: u64,
    pub embedding_calls: u64,
    pub embedding_failures: u64,
    pub store_upserts: u64,
    pub store_queries: u64,
    pub store_failures: u64,
    pub llm_calls: u64,
    pub llm_failures: u64,
    pub llm_tokens: u64,
    pub judge_calls: u64,
    pub judge_parse_failures: u64,
    pub questions_answered: u64,
    pub answers_degraded: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub answer_latency_ms: u64,
}

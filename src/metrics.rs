use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing summarization activity.
#[derive(Default)]
pub struct PipelineMetrics {
    requests_completed: AtomicU64,
    requests_partial: AtomicU64,
    requests_failed: AtomicU64,
    chunks_summarized: AtomicU64,
    chunk_failures: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivered request along with its chunk outcomes.
    pub fn record_completed(&self, summarized: u64, failed: u64) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        if failed > 0 {
            self.requests_partial.fetch_add(1, Ordering::Relaxed);
        }
        self.record_chunks(summarized, failed);
    }

    /// Record a request that ended in the failed stage.
    pub fn record_failed(&self, summarized: u64, failed: u64) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.record_chunks(summarized, failed);
    }

    fn record_chunks(&self, summarized: u64, failed: u64) {
        self.chunks_summarized
            .fetch_add(summarized, Ordering::Relaxed);
        self.chunk_failures.fetch_add(failed, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_partial: self.requests_partial.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            chunks_summarized: self.chunks_summarized.load(Ordering::Relaxed),
            chunk_failures: self.chunk_failures.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of summarization counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Requests that delivered a summary (complete or partial).
    pub requests_completed: u64,
    /// Delivered requests whose summary skipped at least one chunk.
    pub requests_partial: u64,
    /// Requests that ended in the failed stage.
    pub requests_failed: u64,
    /// Chunk summaries produced across all requests.
    pub chunks_summarized: u64,
    /// Chunks that failed after exhausting their retries.
    pub chunk_failures: u64,
}

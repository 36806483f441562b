//! Map/combine reduction of chunks into one summary.
//!
//! Each chunk is summarized independently with bounded concurrency; transient failures are
//! retried with exponential backoff. Outcomes are reassembled by chunk index, the
//! partial-failure policy decides whether enough chunks survived, and a single combine call
//! merges the surviving summaries when the document had more than one chunk.

use futures_core::Stream;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

use super::types::{Chunk, ChunkSummary, PipelineError, ReductionResult};
use crate::summarization::{ServiceError, SummarizationService, TEXT_PLACEHOLDER};

/// Retry, timeout, and failure-tolerance policy of the reduction pipeline.
#[derive(Debug, Clone)]
pub struct ReductionPolicy {
    /// Retries after the first attempt of each call.
    pub max_retries: usize,
    /// First backoff delay; later delays double.
    pub retry_base_delay: Duration,
    /// Fraction of chunks that may fail while still producing a partial result.
    pub partial_failure_ratio: f64,
    /// Chunk calls in flight at once.
    pub max_concurrency: usize,
    /// Timeout applied to every summarization call.
    pub call_timeout: Duration,
}

impl ReductionPolicy {
    /// Chunk failures tolerated out of `total`: the configured fraction, at least one.
    pub fn allowed_failures(&self, total: usize) -> usize {
        ((total as f64 * self.partial_failure_ratio).floor() as usize).max(1)
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.retry_base_delay.as_millis() / 2) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .map(jitter)
            .take(self.max_retries)
    }
}

/// Result of summarizing one chunk after retries.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    /// Index of the chunk.
    pub index: usize,
    /// Summary, or the last error once retries ran out.
    pub result: Result<String, ServiceError>,
}

/// Drives the summarization service over a document's chunks.
pub struct ReductionPipeline {
    service: Arc<dyn SummarizationService>,
    policy: ReductionPolicy,
}

impl ReductionPipeline {
    /// Build a pipeline around a summarization service.
    pub fn new(service: Arc<dyn SummarizationService>, policy: ReductionPolicy) -> Self {
        Self { service, policy }
    }

    /// Policy in effect.
    pub fn policy(&self) -> &ReductionPolicy {
        &self.policy
    }

    /// Whether a document split into `total` chunks needs a combine pass.
    pub fn requires_combine(total: usize) -> bool {
        total > 1
    }

    /// Summarize every chunk, yielding outcomes in completion order.
    ///
    /// At most `max_concurrency` calls are in flight. Dropping the stream abandons the
    /// outstanding calls.
    pub fn map_chunks<'a>(
        &'a self,
        chunks: &'a [Chunk],
        instruction: &'a str,
    ) -> impl Stream<Item = ChunkOutcome> + Send + 'a {
        stream::iter(chunks)
            .map(move |chunk| async move {
                ChunkOutcome {
                    index: chunk.index,
                    result: self
                        .call_with_retry(&chunk.text, instruction, Some(chunk.index))
                        .await,
                }
            })
            .buffer_unordered(self.policy.max_concurrency.max(1))
    }

    /// Order outcomes by chunk index and apply the partial-failure policy.
    ///
    /// Fails with [`PipelineError::Exhausted`] when more chunks failed than the policy allows
    /// or when no chunk succeeded.
    pub fn assemble(&self, mut outcomes: Vec<ChunkOutcome>) -> Result<ReductionResult, PipelineError> {
        outcomes.sort_by_key(|outcome| outcome.index);
        let total = outcomes.len();
        let allowed = self.policy.allowed_failures(total);

        let mut chunk_summaries = Vec::with_capacity(total);
        let mut failed_chunks = Vec::new();
        let mut last_error = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(text) => chunk_summaries.push(ChunkSummary {
                    index: outcome.index,
                    text,
                }),
                Err(error) => {
                    failed_chunks.push(outcome.index);
                    last_error = Some(error);
                }
            }
        }

        if failed_chunks.len() > allowed || chunk_summaries.is_empty() {
            tracing::warn!(
                failed = failed_chunks.len(),
                total,
                allowed,
                "Too many chunk failures; abandoning request"
            );
            return Err(PipelineError::Exhausted {
                failed: failed_chunks.len(),
                total,
                allowed,
                last_error,
            });
        }
        if !failed_chunks.is_empty() {
            tracing::info!(
                failed = ?failed_chunks,
                total,
                "Continuing with a partial set of chunk summaries"
            );
        }

        Ok(ReductionResult {
            chunk_summaries,
            failed_chunks,
            final_summary: None,
        })
    }

    /// Merge ordered chunk summaries into one summary honoring `instruction`.
    pub async fn combine(
        &self,
        summaries: &[ChunkSummary],
        instruction: &str,
    ) -> Result<String, PipelineError> {
        let input = combine_input(summaries);
        let combine_instruction = combine_instruction(instruction);
        tracing::debug!(sections = summaries.len(), "Combining chunk summaries");
        self.call_with_retry(&input, &combine_instruction, None)
            .await
            .map_err(PipelineError::Combine)
    }

    /// Summarize chunks end to end: map, assemble, and combine when needed.
    pub async fn summarize(
        &self,
        chunks: &[Chunk],
        instruction: &str,
    ) -> Result<ReductionResult, PipelineError> {
        let outcomes: Vec<ChunkOutcome> = self.map_chunks(chunks, instruction).collect().await;
        let mut result = self.assemble(outcomes)?;
        let final_summary = if Self::requires_combine(chunks.len()) {
            self.combine(&result.chunk_summaries, instruction).await?
        } else {
            result.chunk_summaries[0].text.clone()
        };
        result.final_summary = Some(final_summary);
        Ok(result)
    }

    async fn call_with_retry(
        &self,
        text: &str,
        instruction: &str,
        chunk: Option<usize>,
    ) -> Result<String, ServiceError> {
        let timeout = self.policy.call_timeout;
        let mut attempt = 0usize;
        RetryIf::spawn(
            self.policy.backoff(),
            || {
                attempt += 1;
                let current = attempt;
                async move {
                    let result =
                        match tokio::time::timeout(timeout, self.service.complete(text, instruction))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ServiceError::Transient(format!(
                                "call timed out after {}s",
                                timeout.as_secs_f32()
                            ))),
                        };
                    if let Err(error) = &result {
                        tracing::warn!(
                            chunk = ?chunk,
                            attempt = current,
                            error = %error,
                            "Summarization call failed"
                        );
                    }
                    result
                }
            },
            |error: &ServiceError| error.is_retryable(),
        )
        .await
    }
}

/// Tag each summary with its 1-based section number, in order.
fn combine_input(summaries: &[ChunkSummary]) -> String {
    summaries
        .iter()
        .map(|summary| format!("[Section {}]\n{}", summary.index + 1, summary.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn combine_instruction(instruction: &str) -> String {
    let user_instruction = instruction.replace(TEXT_PLACEHOLDER, "the document");
    format!(
        "The sections below are summaries of consecutive parts of one document, in order. \
Merge them into a single coherent summary that does not repeat itself. \
The result must follow these instructions:\n---\n{}\n---\n\nSection summaries:\n{TEXT_PLACEHOLDER}",
        user_instruction.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::testing::{ScriptedService, chunks_from};

    fn policy() -> ReductionPolicy {
        ReductionPolicy {
            max_retries: 2,
            retry_base_delay: Duration::ZERO,
            partial_failure_ratio: 0.2,
            max_concurrency: 3,
            call_timeout: Duration::from_secs(5),
        }
    }

    fn pipeline(service: Arc<ScriptedService>) -> ReductionPipeline {
        ReductionPipeline::new(service, policy())
    }

    #[test]
    fn allowance_is_a_fraction_with_a_floor_of_one() {
        let policy = policy();
        assert_eq!(policy.allowed_failures(1), 1);
        assert_eq!(policy.allowed_failures(5), 1);
        assert_eq!(policy.allowed_failures(10), 2);
        assert_eq!(policy.allowed_failures(23), 4);
    }

    #[tokio::test]
    async fn single_chunk_skips_combine() {
        let service = Arc::new(ScriptedService::new());
        let chunks = chunks_from(&["only chunk"]);

        let result = pipeline(service.clone())
            .summarize(&chunks, "Summarize")
            .await
            .expect("result");

        assert_eq!(service.calls().len(), 1);
        assert_eq!(service.combine_calls().len(), 0);
        assert_eq!(result.final_summary.as_deref(), Some("summary of only chunk"));
        assert!(!result.is_partial());
    }

    #[tokio::test]
    async fn multiple_chunks_issue_exactly_one_combine_call() {
        let service = Arc::new(ScriptedService::new());
        let chunks = chunks_from(&["alpha text", "beta text", "gamma text"]);

        let result = pipeline(service.clone())
            .summarize(&chunks, "Focus on numbers.")
            .await
            .expect("result");

        let combines = service.combine_calls();
        assert_eq!(combines.len(), 1);
        assert_eq!(service.calls().len(), 4);
        assert!(combines[0].text.starts_with("[Section 1]\nsummary of alpha text"));
        assert!(combines[0].text.contains("[Section 3]\nsummary of gamma text"));
        assert!(combines[0].instruction.contains("Focus on numbers."));
        assert_eq!(result.chunk_summaries.len(), 3);
        assert_eq!(
            result.final_summary.as_deref(),
            Some("summary of [Section 1]")
        );
    }

    #[tokio::test]
    async fn summaries_keep_chunk_order_despite_completion_order() {
        let service = Arc::new(
            ScriptedService::new()
                .with_delay("first", Duration::from_millis(60))
                .with_delay("second", Duration::from_millis(30)),
        );
        let chunks = chunks_from(&["first", "second", "third"]);

        let result = pipeline(service.clone())
            .summarize(&chunks, "Summarize")
            .await
            .expect("result");

        let indices: Vec<usize> = result.chunk_summaries.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let finished: Vec<String> = service
            .completions()
            .into_iter()
            .filter(|text| !text.starts_with("[Section "))
            .collect();
        assert_eq!(finished, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let service = Arc::new(ScriptedService::new().with_delay("chunk", Duration::from_millis(20)));
        let texts: Vec<String> = (0..10).map(|i| format!("chunk {i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let chunks = chunks_from(&refs);

        pipeline(service.clone())
            .summarize(&chunks, "Summarize")
            .await
            .expect("result");

        assert!(service.max_in_flight() <= 3);
        assert!(service.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let service = Arc::new(ScriptedService::new().fail_times(
            "beta",
            2,
            ServiceError::Transient("overloaded".into()),
        ));
        let chunks = chunks_from(&["alpha", "beta", "gamma"]);

        let result = pipeline(service.clone())
            .summarize(&chunks, "Summarize")
            .await
            .expect("result");

        assert!(!result.is_partial());
        assert_eq!(result.chunk_summaries[1].text, "summary of beta");
        let beta_calls = service
            .calls()
            .iter()
            .filter(|call| call.text == "beta")
            .count();
        assert_eq!(beta_calls, 3);
    }

    #[tokio::test]
    async fn quota_errors_are_not_retried() {
        let service = Arc::new(ScriptedService::new().fail_times(
            "beta",
            usize::MAX,
            ServiceError::Quota("limit".into()),
        ));
        let chunks = chunks_from(&["alpha", "beta", "gamma", "delta", "epsilon"]);

        let result = pipeline(service.clone())
            .summarize(&chunks, "Summarize")
            .await
            .expect("partial result");

        let beta_calls = service
            .calls()
            .iter()
            .filter(|call| call.text == "beta")
            .count();
        assert_eq!(beta_calls, 1);
        assert!(result.is_partial());
        assert_eq!(result.failed_chunks, vec![1]);
        assert_eq!(result.chunk_summaries.len(), 4);
        assert!(!service.combine_calls()[0].text.contains("[Section 2]"));
    }

    #[tokio::test]
    async fn too_many_failures_exhaust_the_pipeline_without_combining() {
        let service = Arc::new(
            ScriptedService::new()
                .fail_times("beta", usize::MAX, ServiceError::Transient("down".into()))
                .fail_times("delta", usize::MAX, ServiceError::Transient("down".into())),
        );
        let chunks = chunks_from(&["alpha", "beta", "gamma", "delta", "epsilon"]);

        let error = pipeline(service.clone())
            .summarize(&chunks, "Summarize")
            .await
            .expect_err("exhausted");

        assert!(matches!(
            error,
            PipelineError::Exhausted {
                failed: 2,
                total: 5,
                allowed: 1,
                ..
            }
        ));
        assert!(service.combine_calls().is_empty());
    }

    #[tokio::test]
    async fn a_lone_failed_chunk_exhausts_the_pipeline() {
        let service = Arc::new(ScriptedService::new().fail_times(
            "only",
            usize::MAX,
            ServiceError::Invalid("bad".into()),
        ));
        let chunks = chunks_from(&["only"]);

        let error = pipeline(service)
            .summarize(&chunks, "Summarize")
            .await
            .expect_err("exhausted");
        assert!(matches!(error, PipelineError::Exhausted { failed: 1, total: 1, .. }));
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_transient() {
        let service = Arc::new(ScriptedService::new().with_delay("slow", Duration::from_millis(200)));
        let mut policy = policy();
        policy.call_timeout = Duration::from_millis(20);
        policy.max_retries = 1;
        let pipeline = ReductionPipeline::new(service.clone(), policy);
        let chunks = chunks_from(&["slow"]);

        let error = pipeline
            .summarize(&chunks, "Summarize")
            .await
            .expect_err("timed out");
        match error {
            PipelineError::Exhausted {
                last_error: Some(ServiceError::Transient(message)),
                ..
            } => assert!(message.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(service.calls().len(), 2);
    }

    #[test]
    fn combine_instruction_keeps_user_intent_and_one_placeholder() {
        let instruction = combine_instruction("Bullet points.\nText: {text}");
        assert!(instruction.contains("Bullet points."));
        assert_eq!(instruction.matches(TEXT_PLACEHOLDER).count(), 1);
        assert!(instruction.trim_end().ends_with(TEXT_PLACEHOLDER));
    }
}

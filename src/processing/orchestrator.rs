//! End-to-end driver of one summarization request.
//!
//! [`Orchestrator::run`] returns a lazy stream of [`ProgressEvent`]s. The stream performs the
//! work as it is polled, so dropping it cancels the request: no further stages run, in-flight
//! service calls are abandoned, and the uploaded blob is released.

use bytes::Bytes;
use futures_core::Stream;
use futures_util::{StreamExt, pin_mut};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::chunking::Chunker;
use super::progress::{CompletedSummary, ProgressEmitter, ProgressEvent, Stage};
use super::prompts::PromptStore;
use super::reduce::{ReductionPipeline, ReductionPolicy};
use super::types::{
    ChunkSet, Document, DocumentRef, InputError, RequestError, RequestId, SummarizationRequest,
    UserId,
};
use crate::blob::{BlobLease, BlobSource};
use crate::extract::TextExtractor;
use crate::metrics::PipelineMetrics;
use crate::summarization::SummarizationService;

/// Limits applied to the I/O stages of a request.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Timeout for fetching and extracting the upload.
    pub call_timeout: Duration,
    /// Largest upload accepted, in bytes.
    pub max_document_bytes: u64,
}

/// External systems the orchestrator drives.
pub struct Collaborators {
    /// Where uploads are stored.
    pub blobs: Arc<dyn BlobSource>,
    /// PDF text extractor.
    pub extractor: Arc<dyn TextExtractor>,
    /// Summarization backend.
    pub service: Arc<dyn SummarizationService>,
}

/// Whether a reduction covered every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionKind {
    /// Every chunk was summarized.
    Complete,
    /// Some chunks failed within the tolerated allowance.
    Partial,
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Accepted, nothing fetched yet.
    Init,
    /// Upload bytes fetched.
    Downloaded,
    /// Page text extracted.
    Extracted,
    /// Text split into chunks.
    Chunked,
    /// Chunk summaries in progress.
    Reducing,
    /// Final summary produced.
    Reduced(ReductionKind),
    /// Summary handed to the requester.
    Delivered,
    /// Request abandoned.
    Failed,
}

impl RequestState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Delivered | Failed, _) => false,
            (_, Failed) => true,
            (Init, Downloaded)
            | (Downloaded, Extracted)
            | (Extracted, Chunked)
            | (Chunked, Reducing)
            | (Reducing, Reduced(_))
            | (Reduced(_), Delivered) => true,
            _ => false,
        }
    }

    /// Whether the request has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// Coordinates fetch, extraction, chunking, and reduction for each request.
pub struct Orchestrator {
    blobs: Arc<dyn BlobSource>,
    extractor: Arc<dyn TextExtractor>,
    chunker: Chunker,
    prompts: Arc<PromptStore>,
    pipeline: ReductionPipeline,
    metrics: Arc<PipelineMetrics>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Assemble an orchestrator from its collaborators and policies.
    pub fn new(
        collaborators: Collaborators,
        prompts: Arc<PromptStore>,
        chunker: Chunker,
        policy: ReductionPolicy,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            blobs: collaborators.blobs,
            extractor: collaborators.extractor,
            chunker,
            prompts,
            pipeline: ReductionPipeline::new(collaborators.service, policy),
            metrics: Arc::new(PipelineMetrics::new()),
            settings,
        }
    }

    /// Prompt store consulted at submission.
    pub fn prompts(&self) -> &Arc<PromptStore> {
        &self.prompts
    }

    /// Blob source uploads are stored in.
    pub fn blobs(&self) -> &Arc<dyn BlobSource> {
        &self.blobs
    }

    /// Counters updated as requests finish.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Stage limits in effect.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Create a request for an uploaded document, snapshotting the user's prompt.
    ///
    /// Later prompt changes do not affect the returned request.
    pub fn submit(&self, user_id: &UserId, document: DocumentRef) -> SummarizationRequest {
        let prompt = self.prompts.profile(user_id);
        let instruction = prompt
            .custom_instruction
            .clone()
            .unwrap_or_else(|| self.prompts.default_instruction().to_string());
        let request = SummarizationRequest {
            request_id: RequestId::new(),
            document,
            prompt,
            instruction,
        };
        tracing::info!(
            request_id = %request.request_id,
            user_id = %user_id,
            file_name = %request.document.file_name,
            custom_prompt = request.prompt.is_custom(),
            "Summarization request submitted"
        );
        request
    }

    /// Process a request, yielding its progress events in order.
    ///
    /// The stream ends right after its single terminal event (`Completed` or `Failed`).
    pub fn run(
        &self,
        request: SummarizationRequest,
    ) -> impl Stream<Item = ProgressEvent> + Send + '_ {
        async_stream::stream! {
            let mut tracker = RequestTracker::new(request.request_id, self.metrics.clone());
            let instruction = request.instruction.as_str();

            if let Some(event) = tracker.emit(Stage::Starting) {
                yield event;
            }

            if let Some(event) = tracker.emit(Stage::Downloading) {
                yield event;
            }
            let (lease, bytes) = match self.download(&request.document).await {
                Ok(fetched) => fetched,
                Err(error) => {
                    if let Some(event) = tracker.fail(error) {
                        yield event;
                    }
                    return;
                }
            };
            tracker.advance(RequestState::Downloaded);

            if let Some(event) = tracker.emit(Stage::Extracting) {
                yield event;
            }
            let extracted = self.extract(bytes).await;
            drop(lease);
            let document = match extracted {
                Ok(document) => document,
                Err(error) => {
                    if let Some(event) = tracker.fail(error) {
                        yield event;
                    }
                    return;
                }
            };
            tracker.advance(RequestState::Extracted);

            if let Some(event) = tracker.emit(Stage::Chunking) {
                yield event;
            }
            let (document, chunk_set) = match self.chunk(document).await {
                Ok(chunked) => chunked,
                Err(error) => {
                    if let Some(event) = tracker.fail(error) {
                        yield event;
                    }
                    return;
                }
            };
            if chunk_set.empty_document {
                if let Some(event) = tracker.fail(InputError::EmptyDocument.into()) {
                    yield event;
                }
                return;
            }
            let total = chunk_set.len();
            tracing::info!(
                request_id = %request.request_id,
                pages = document.page_count(),
                chunks = total,
                "Document chunked"
            );
            tracker.advance(RequestState::Chunked);

            tracker.advance(RequestState::Reducing);
            let mut outcomes = Vec::with_capacity(total);
            {
                let mapped = self.pipeline.map_chunks(&chunk_set.chunks, instruction);
                pin_mut!(mapped);
                while let Some(outcome) = mapped.next().await {
                    tracker.count_chunk(outcome.result.is_ok());
                    outcomes.push(outcome);
                    if let Some(event) = tracker.emit(Stage::Summarizing { done: outcomes.len(), total }) {
                        yield event;
                    }
                }
            }

            let mut result = match self.pipeline.assemble(outcomes) {
                Ok(result) => result,
                Err(error) => {
                    if let Some(event) = tracker.fail(error.into()) {
                        yield event;
                    }
                    return;
                }
            };

            let final_summary = if ReductionPipeline::requires_combine(total) {
                if let Some(event) = tracker.emit(Stage::Combining) {
                    yield event;
                }
                match self.pipeline.combine(&result.chunk_summaries, instruction).await {
                    Ok(summary) => summary,
                    Err(error) => {
                        if let Some(event) = tracker.fail(error.into()) {
                            yield event;
                        }
                        return;
                    }
                }
            } else {
                result.chunk_summaries[0].text.clone()
            };
            result.final_summary = Some(final_summary.clone());
            let kind = if result.is_partial() {
                ReductionKind::Partial
            } else {
                ReductionKind::Complete
            };
            tracker.advance(RequestState::Reduced(kind));

            let completed = CompletedSummary {
                file_name: request.document.file_name.clone(),
                summary: final_summary,
                partial: result.is_partial(),
                page_count: document.page_count(),
                chunk_count: total,
                custom_prompt: request.prompt.is_custom(),
            };
            if let Some(event) = tracker.complete(completed) {
                yield event;
            }
        }
    }

    /// Tokenizer-backed splitting is CPU heavy, so it runs on the blocking pool.
    async fn chunk(&self, document: Document) -> Result<(Document, ChunkSet), RequestError> {
        let chunker = self.chunker.clone();
        tokio::task::spawn_blocking(move || {
            let chunk_set = chunker.split(&document);
            (document, chunk_set)
        })
        .await
        .map_err(|error| RequestError::Worker(format!("chunking task failed: {error}")))
    }

    async fn download(&self, document: &DocumentRef) -> Result<(BlobLease, Bytes), RequestError> {
        let lease = BlobLease::new(self.blobs.clone(), document.file_ref.clone());
        if !is_pdf_name(&document.file_name) {
            return Err(InputError::UnsupportedFileType(document.file_name.clone()).into());
        }

        let bytes = self
            .with_timeout("downloading", self.blobs.fetch(&document.file_ref))
            .await?
            .map_err(InputError::from)?;
        let size = bytes.len() as u64;
        if size > self.settings.max_document_bytes {
            return Err(InputError::TooLarge {
                size,
                limit: self.settings.max_document_bytes,
            }
            .into());
        }
        Ok((lease, bytes))
    }

    async fn extract(&self, bytes: Bytes) -> Result<Document, RequestError> {
        let document = self
            .with_timeout("reading the PDF", self.extractor.extract(bytes))
            .await?
            .map_err(InputError::from)?;
        Ok(document)
    }

    async fn with_timeout<F: Future>(
        &self,
        stage: &'static str,
        future: F,
    ) -> Result<F::Output, RequestError> {
        tokio::time::timeout(self.settings.call_timeout, future)
            .await
            .map_err(|_| InputError::Timeout(stage).into())
    }
}

fn is_pdf_name(file_name: &str) -> bool {
    std::path::Path::new(file_name)
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("pdf"))
}

/// Couples the lifecycle state with the event emitter and chunk counters.
struct RequestTracker {
    request_id: RequestId,
    state: RequestState,
    emitter: ProgressEmitter,
    metrics: Arc<PipelineMetrics>,
    summarized: u64,
    failed: u64,
}

impl RequestTracker {
    fn new(request_id: RequestId, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            request_id,
            state: RequestState::Init,
            emitter: ProgressEmitter::new(request_id),
            metrics,
            summarized: 0,
            failed: 0,
        }
    }

    fn emit(&mut self, stage: Stage) -> Option<ProgressEvent> {
        match self.emitter.emit(stage) {
            Ok(event) => Some(event),
            Err(error) => {
                tracing::error!(request_id = %self.request_id, error = %error, "Progress event rejected");
                None
            }
        }
    }

    fn advance(&mut self, next: RequestState) {
        if !self.state.can_transition_to(next) {
            tracing::error!(
                request_id = %self.request_id,
                from = ?self.state,
                to = ?next,
                "Invalid request state transition"
            );
        }
        self.state = next;
    }

    fn count_chunk(&mut self, succeeded: bool) {
        if succeeded {
            self.summarized += 1;
        } else {
            self.failed += 1;
        }
    }

    fn fail(&mut self, error: RequestError) -> Option<ProgressEvent> {
        tracing::warn!(
            request_id = %self.request_id,
            state = ?self.state,
            error = %error,
            "Summarization request failed"
        );
        self.advance(RequestState::Failed);
        self.metrics.record_failed(self.summarized, self.failed);
        self.emit(Stage::Failed {
            cause: error.user_message(),
        })
    }

    fn complete(&mut self, summary: CompletedSummary) -> Option<ProgressEvent> {
        tracing::info!(
            request_id = %self.request_id,
            chunks = summary.chunk_count,
            partial = summary.partial,
            "Summarization request completed"
        );
        self.advance(RequestState::Delivered);
        self.metrics.record_completed(self.summarized, self.failed);
        self.emit(Stage::Completed(summary))
    }
}

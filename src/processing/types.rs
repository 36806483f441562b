//! Core data types and error definitions for the summarization pipeline.

use crate::blob::{BlobError, FileRef};
use crate::extract::ExtractError;
use crate::summarization::ServiceError;
use anyhow::Error as TokenizerError;
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Separator inserted between page texts when a document is flattened.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Identity of the user who owns prompts and requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier assigned to one summarization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Allocate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Ordered page texts extracted from one PDF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pages: Vec<String>,
}

impl Document {
    /// Wrap extracted page texts, preserving their order.
    pub fn new(pages: Vec<String>) -> Self {
        Self { pages }
    }

    /// Page texts in document order.
    pub fn pages(&self) -> &[String] {
        &self.pages
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Whether no page carries any non-whitespace text.
    pub fn is_blank(&self) -> bool {
        self.pages.iter().all(|page| page.trim().is_empty())
    }

    /// Flatten the document into one string, pages joined by [`PAGE_SEPARATOR`].
    pub fn text(&self) -> String {
        self.pages.join(PAGE_SEPARATOR)
    }
}

/// Contiguous slice of document text submitted as one summarization unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position in the chunk sequence.
    pub index: usize,
    /// Text sent to the summarization service, overlap prefix included.
    pub text: String,
    /// Byte length of the prefix repeated from the previous chunk.
    pub overlap_len: usize,
    /// Byte offset of the chunk body within the flattened document.
    pub offset: usize,
}

impl Chunk {
    /// Portion of the chunk that is new relative to the previous chunk.
    pub fn body(&self) -> &str {
        &self.text[self.overlap_len..]
    }
}

/// Output of the chunker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSet {
    /// Chunks in document order; never empty.
    pub chunks: Vec<Chunk>,
    /// Set when the document had no text and the single chunk is empty.
    pub empty_document: bool,
}

impl ChunkSet {
    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the set holds no chunks. Always false for chunker output.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Concatenate chunk bodies, reconstructing the flattened document.
    pub fn reconstruct(&self) -> String {
        self.chunks.iter().map(Chunk::body).collect()
    }
}

/// A user's summarization preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptProfile {
    /// Owner of the profile.
    pub user_id: UserId,
    /// Custom instruction, `None` when the default applies.
    pub custom_instruction: Option<String>,
    /// Last time the profile was changed by the user.
    pub updated_at: Option<OffsetDateTime>,
}

impl PromptProfile {
    /// Profile of a user who never customized their prompt.
    pub fn default_for(user_id: UserId) -> Self {
        Self {
            user_id,
            custom_instruction: None,
            updated_at: None,
        }
    }

    /// Whether a custom instruction is set.
    pub fn is_custom(&self) -> bool {
        self.custom_instruction.is_some()
    }
}

/// An uploaded document awaiting summarization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    /// Handle inside the blob source.
    pub file_ref: FileRef,
    /// Name the user gave the file.
    pub file_name: String,
}

/// One end-to-end summarization request.
#[derive(Debug, Clone)]
pub struct SummarizationRequest {
    /// Identifier used to correlate progress events.
    pub request_id: RequestId,
    /// Uploaded document.
    pub document: DocumentRef,
    /// Prompt settings captured at upload time.
    pub prompt: PromptProfile,
    /// Instruction resolved from the profile at upload time.
    pub instruction: String,
}

/// Summary produced for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSummary {
    /// Index of the summarized chunk.
    pub index: usize,
    /// Summary text.
    pub text: String,
}

/// Outcome of the reduction pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionResult {
    /// Successful chunk summaries in chunk order.
    pub chunk_summaries: Vec<ChunkSummary>,
    /// Indices of chunks that failed after retries.
    pub failed_chunks: Vec<usize>,
    /// Final summary, set once the combine pass (or the single-chunk shortcut) succeeds.
    pub final_summary: Option<String>,
}

impl ReductionResult {
    /// Whether the result was produced despite chunk failures.
    pub fn is_partial(&self) -> bool {
        !self.failed_chunks.is_empty()
    }
}

/// Errors produced while turning document text into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Chunking was configured with an impossible budget.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Tokenizer resources were unavailable for the configured model.
    #[error("failed to initialize tokenizer for model '{model}': {source}")]
    Tokenizer {
        /// Tokenizer model we attempted to load.
        model: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: TokenizerError,
    },
}

/// Rejected prompt update.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("prompt must contain non-whitespace text")]
pub struct InvalidPromptError;

/// Errors emitted by the reduction pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// More chunks failed than the partial-failure policy tolerates.
    #[error("{failed} of {total} chunks failed to summarize (at most {allowed} tolerated)")]
    Exhausted {
        /// Chunks that failed after retries.
        failed: usize,
        /// Chunks submitted.
        total: usize,
        /// Failures the policy tolerates.
        allowed: usize,
        /// Last error observed for a failed chunk.
        #[source]
        last_error: Option<ServiceError>,
    },
    /// The combine pass failed.
    #[error("combine pass failed: {0}")]
    Combine(#[source] ServiceError),
}

/// Problems with the uploaded file; reported to the user, never retried.
#[derive(Debug, Error)]
pub enum InputError {
    /// File name does not look like a PDF.
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    /// Upload is missing from the blob source.
    #[error("upload not found: {0}")]
    NotFound(FileRef),
    /// Upload exceeds the size ceiling.
    #[error("upload is {size} bytes, limit is {limit}")]
    TooLarge {
        /// Upload size in bytes.
        size: u64,
        /// Configured ceiling in bytes.
        limit: u64,
    },
    /// Extractor could not parse the PDF.
    #[error("unreadable pdf: {0}")]
    UnreadablePdf(String),
    /// PDF parsed but contained no text.
    #[error("pdf contains no extractable text")]
    EmptyDocument,
    /// Download or extraction exceeded the per-call timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// Blob storage failed for reasons unrelated to the file itself.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<BlobError> for InputError {
    fn from(error: BlobError) -> Self {
        match error {
            BlobError::NotFound(file_ref) => Self::NotFound(file_ref),
            BlobError::TooLarge { size, limit } => Self::TooLarge { size, limit },
            BlobError::Io(error) => Self::Storage(error.to_string()),
        }
    }
}

impl From<ExtractError> for InputError {
    fn from(error: ExtractError) -> Self {
        match error {
            ExtractError::UnreadablePdf(reason) => Self::UnreadablePdf(reason),
            ExtractError::Encrypted => Self::UnreadablePdf("document is encrypted".into()),
        }
    }
}

/// Terminal failure of a summarization request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Uploaded file was rejected.
    #[error("input rejected: {0}")]
    Input(#[from] InputError),
    /// A background worker for this request stopped unexpectedly.
    #[error("worker failed: {0}")]
    Worker(String),
    /// Reduction pipeline gave up.
    #[error("summarization failed: {0}")]
    Pipeline(#[from] PipelineError),
}

impl RequestError {
    /// Human-readable cause safe to show the requester.
    pub fn user_message(&self) -> String {
        match self {
            Self::Input(InputError::UnsupportedFileType(_)) => {
                "Wrong file type. Please send PDF files only.".into()
            }
            Self::Input(InputError::NotFound(_)) => {
                "The uploaded file could not be found. Please send it again.".into()
            }
            Self::Input(InputError::TooLarge { limit, .. }) => format!(
                "File too large. Please send files smaller than {}MB.",
                limit / (1024 * 1024)
            ),
            Self::Input(InputError::UnreadablePdf(_)) => {
                "Sorry, I couldn't read your PDF. Make sure it's a valid PDF with readable text."
                    .into()
            }
            Self::Input(InputError::EmptyDocument) => {
                "The PDF does not contain any readable text.".into()
            }
            Self::Input(InputError::Timeout(stage)) => {
                format!("Processing timed out while {stage}. Please try again.")
            }
            Self::Input(InputError::Storage(_)) | Self::Worker(_) => {
                "Sorry, something went wrong while preparing your PDF. Please try again.".into()
            }
            Self::Pipeline(PipelineError::Exhausted { failed, total, .. }) => format!(
                "Too many parts of the document could not be summarized ({failed} of {total}). Please try again later."
            ),
            Self::Pipeline(PipelineError::Combine(error)) => service_message(error),
        }
    }
}

fn service_message(error: &ServiceError) -> String {
    match error {
        ServiceError::Transient(_) => {
            "The summarization service is temporarily unavailable. Please try again.".into()
        }
        ServiceError::Quota(_) => {
            "The summarization service is over its quota right now. Please try again later.".into()
        }
        ServiceError::Invalid(_) => "The summarization service rejected the request.".into(),
    }
}

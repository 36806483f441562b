//! Summarization pipeline: chunking, prompt state, map/combine reduction, and orchestration.

pub mod chunking;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod reduce;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use chunking::{Chunker, ChunkerSettings};
pub use orchestrator::{
    Collaborators, Orchestrator, OrchestratorSettings, ReductionKind, RequestState,
};
pub use progress::{CompletedSummary, ProgressEmitter, ProgressError, ProgressEvent, Stage};
pub use prompts::PromptStore;
pub use reduce::{ChunkOutcome, ReductionPipeline, ReductionPolicy};
pub use types::{
    Chunk, ChunkSet, ChunkSummary, ChunkingError, Document, DocumentRef, InputError,
    InvalidPromptError, PipelineError, PromptProfile, ReductionResult, RequestError, RequestId,
    SummarizationRequest, UserId,
};

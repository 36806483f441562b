//! Ordered progress events for one request.

use serde::Serialize;
use thiserror::Error;

use super::types::RequestId;

/// Final payload of a delivered request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedSummary {
    /// File name supplied with the upload.
    pub file_name: String,
    /// Final (or partial) summary text.
    pub summary: String,
    /// Set when some chunks were skipped after failing.
    pub partial: bool,
    /// Pages extracted from the PDF.
    pub page_count: usize,
    /// Chunks the document was split into.
    pub chunk_count: usize,
    /// Whether the user's custom prompt was applied.
    pub custom_prompt: bool,
}

const TRUNCATION_NOTICE: &str = "\n\n... (Summary truncated due to length limits)";

impl CompletedSummary {
    /// Render the delivery message, truncated to `max_chars` characters.
    pub fn render(&self, max_chars: usize) -> String {
        let prompt = if self.custom_prompt {
            "Custom"
        } else {
            "Default"
        };
        let mut message = format!(
            "Summary Complete!\n\nFile: {}\nPages: {} - Chunks: {}\nPrompt: {}\n",
            self.file_name, self.page_count, self.chunk_count, prompt
        );
        if self.partial {
            message.push_str("Note: some sections could not be summarized and were skipped.\n");
        }
        message.push_str("\nSummary:\n");
        message.push_str(&self.summary);

        if message.chars().count() <= max_chars {
            return message;
        }
        let keep = max_chars.saturating_sub(TRUNCATION_NOTICE.chars().count());
        let mut truncated: String = message.chars().take(keep).collect();
        truncated.push_str(TRUNCATION_NOTICE);
        truncated
    }
}

/// Milestones of request processing, in the order they occur.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    /// Request accepted.
    Starting,
    /// Upload is being fetched from the blob source.
    Downloading,
    /// Text is being extracted from the PDF.
    Extracting,
    /// Extracted text is being split into chunks.
    Chunking,
    /// `done` of `total` chunk summaries have resolved.
    Summarizing {
        /// Chunks resolved so far.
        done: usize,
        /// Chunks in the request.
        total: usize,
    },
    /// Chunk summaries are being merged.
    Combining,
    /// Request delivered a summary.
    Completed(CompletedSummary),
    /// Request failed with a user-facing cause.
    Failed {
        /// Human-readable cause.
        cause: String,
    },
}

impl Stage {
    /// Position in the fixed stage order; `Summarizing` is further ordered by `done`.
    fn rank(&self) -> (u8, usize) {
        match self {
            Self::Starting => (0, 0),
            Self::Downloading => (1, 0),
            Self::Extracting => (2, 0),
            Self::Chunking => (3, 0),
            Self::Summarizing { done, .. } => (4, *done),
            Self::Combining => (5, 0),
            Self::Completed(_) => (6, 0),
            Self::Failed { .. } => (7, 0),
        }
    }

    /// Whether no event may follow this stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed { .. })
    }

    /// Machine-readable stage name, matching the serialized `stage` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Chunking => "chunking",
            Self::Summarizing { .. } => "summarizing",
            Self::Combining => "combining",
            Self::Completed(_) => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Short label shown to the requester.
    pub fn label(&self) -> String {
        match self {
            Self::Starting => "Processing started".into(),
            Self::Downloading => "Downloading".into(),
            Self::Extracting => "Reading PDF".into(),
            Self::Chunking => "Splitting document".into(),
            Self::Summarizing { done, total } => format!("Summarizing {done}/{total}"),
            Self::Combining => "Combining summaries".into(),
            Self::Completed(_) => "Summary complete".into(),
            Self::Failed { .. } => "Processing failed".into(),
        }
    }
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Request the event belongs to.
    pub request_id: RequestId,
    /// Strictly increasing position within the request, starting at 1.
    pub ordinal: u64,
    /// Human-readable label.
    pub label: String,
    /// Stage reached.
    #[serde(flatten)]
    pub stage: Stage,
}

/// Rejected emission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProgressError {
    /// A terminal event was already emitted.
    #[error("request already reached a terminal stage")]
    AlreadyTerminal,
    /// The stage does not come after the last emitted one.
    #[error("stage '{attempted}' does not follow '{last}'")]
    OutOfOrder {
        /// Label of the last emitted stage.
        last: String,
        /// Label of the rejected stage.
        attempted: String,
    },
}

/// Produces the ordered event sequence of one request.
///
/// Stages must advance through the fixed order; `Failed` may follow any non-terminal stage and
/// nothing follows a terminal one.
#[derive(Debug)]
pub struct ProgressEmitter {
    request_id: RequestId,
    events: Vec<ProgressEvent>,
}

impl ProgressEmitter {
    /// Start an empty sequence for `request_id`.
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            events: Vec::new(),
        }
    }

    /// Append the next stage, returning the event to forward.
    pub fn emit(&mut self, stage: Stage) -> Result<ProgressEvent, ProgressError> {
        if let Some(last) = self.events.last() {
            if last.stage.is_terminal() {
                return Err(ProgressError::AlreadyTerminal);
            }
            let advances = matches!(stage, Stage::Failed { .. }) || stage.rank() > last.stage.rank();
            if !advances {
                return Err(ProgressError::OutOfOrder {
                    last: last.label.clone(),
                    attempted: stage.label(),
                });
            }
        }

        let event = ProgressEvent {
            request_id: self.request_id,
            ordinal: self.events.len() as u64 + 1,
            label: stage.label(),
            stage,
        };
        tracing::debug!(
            request_id = %self.request_id,
            ordinal = event.ordinal,
            stage = %event.label,
            "Progress"
        );
        self.events.push(event.clone());
        Ok(event)
    }

    /// Whether a terminal stage has been emitted.
    pub fn is_finished(&self) -> bool {
        self.events
            .last()
            .is_some_and(|event| event.stage.is_terminal())
    }

    /// Events emitted so far.
    pub fn events(&self) -> &[ProgressEvent] {
        &self.events
    }
}

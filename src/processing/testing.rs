//! Fakes shared by the pipeline, orchestrator, and router tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::types::{Chunk, Document};
use crate::extract::{ExtractError, TextExtractor};
use crate::summarization::{ServiceError, SummarizationService};

/// Build contiguous chunks without overlap from literal texts.
pub(crate) fn chunks_from(texts: &[&str]) -> Vec<Chunk> {
    let mut offset = 0;
    texts
        .iter()
        .enumerate()
        .map(|(index, text)| {
            let chunk = Chunk {
                index,
                text: (*text).to_string(),
                overlap_len: 0,
                offset,
            };
            offset += text.len();
            chunk
        })
        .collect()
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub text: String,
    pub instruction: String,
}

impl RecordedCall {
    pub fn is_combine(&self) -> bool {
        self.text.starts_with("[Section ")
    }
}

struct FailureRule {
    marker: String,
    remaining: usize,
    error: ServiceError,
}

/// Summarization service answering `summary of <first line>`, with scripted failures and delays
/// keyed by substrings of the input text.
#[derive(Default)]
pub(crate) struct ScriptedService {
    failures: Mutex<Vec<FailureRule>>,
    delays: Vec<(String, Duration)>,
    calls: Mutex<Vec<RecordedCall>>,
    completions: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` chunk calls whose text contains `marker`.
    pub fn fail_times(self, marker: &str, times: usize, error: ServiceError) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(FailureRule {
                marker: marker.to_string(),
                remaining: times,
                error,
            });
        }
        self
    }

    pub fn with_delay(mut self, marker: &str, delay: Duration) -> Self {
        self.delays.push((marker.to_string(), delay));
        self
    }

    /// Every call in the order it started.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn combine_calls(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(RecordedCall::is_combine)
            .collect()
    }

    /// Texts of successful calls in the order they finished.
    pub fn completions(&self) -> Vec<String> {
        self.completions.lock().expect("completions lock").clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, text: &str) -> Option<ServiceError> {
        if text.starts_with("[Section ") {
            return None;
        }
        let mut failures = self.failures.lock().expect("failures lock");
        failures
            .iter_mut()
            .find(|rule| rule.remaining > 0 && text.contains(&rule.marker))
            .map(|rule| {
                rule.remaining = rule.remaining.saturating_sub(1);
                rule.error.clone()
            })
    }
}

#[async_trait]
impl SummarizationService for ScriptedService {
    async fn complete(&self, text: &str, instruction: &str) -> Result<String, ServiceError> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            text: text.to_string(),
            instruction: instruction.to_string(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some((_, delay)) = self.delays.iter().find(|(marker, _)| text.contains(marker)) {
            tokio::time::sleep(*delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.scripted_failure(text) {
            return Err(error);
        }
        self.completions
            .lock()
            .expect("completions lock")
            .push(text.to_string());
        let first_line = text.lines().next().unwrap_or_default();
        Ok(format!("summary of {first_line}"))
    }
}

/// Extractor treating the upload as UTF-8 text with form feeds between pages.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, bytes: Bytes) -> Result<Document, ExtractError> {
        let text = std::str::from_utf8(&bytes)
            .map_err(|error| ExtractError::UnreadablePdf(error.to_string()))?;
        Ok(Document::new(
            text.split('\u{c}').map(str::to_string).collect(),
        ))
    }
}

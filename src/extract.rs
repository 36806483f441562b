//! PDF text extraction.

use crate::processing::Document;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors raised while reading text out of a PDF.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Bytes are not a parseable PDF or no page yielded text.
    #[error("unreadable pdf: {0}")]
    UnreadablePdf(String),
    /// PDF is encrypted and cannot be read without a password.
    #[error("pdf is encrypted")]
    Encrypted,
}

/// Turns PDF bytes into ordered page texts.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract every page's text, in page order.
    ///
    /// A parseable PDF whose pages carry no text yields a blank [`Document`] rather than an
    /// error.
    async fn extract(&self, bytes: Bytes) -> Result<Document, ExtractError>;
}

/// Extractor backed by `lopdf`, run on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl LopdfExtractor {
    fn extract_blocking(bytes: &[u8]) -> Result<Document, ExtractError> {
        let document = lopdf::Document::load_mem(bytes)
            .map_err(|error| ExtractError::UnreadablePdf(error.to_string()))?;
        if document.is_encrypted() {
            return Err(ExtractError::Encrypted);
        }

        let mut pages = Vec::new();
        for page_no in document.get_pages().into_keys() {
            match document.extract_text(&[page_no]) {
                Ok(text) => pages.push(text),
                Err(error) => {
                    tracing::debug!(page = page_no, error = %error, "Page text unavailable");
                    pages.push(String::new());
                }
            }
        }

        if pages.is_empty() {
            return Err(ExtractError::UnreadablePdf("document has no pages".into()));
        }
        Ok(Document::new(pages))
    }
}

#[async_trait]
impl TextExtractor for LopdfExtractor {
    async fn extract(&self, bytes: Bytes) -> Result<Document, ExtractError> {
        let document = tokio::task::spawn_blocking(move || Self::extract_blocking(&bytes))
            .await
            .map_err(|error| ExtractError::UnreadablePdf(format!("extractor task failed: {error}")))??;
        tracing::debug!(pages = document.page_count(), "Extracted PDF text");
        Ok(document)
    }
}

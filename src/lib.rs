#![deny(missing_docs)]

//! Core library for the PDF summarizer.

/// HTTP routing and Server-Sent Events delivery.
pub mod api;
/// Storage of uploaded documents.
pub mod blob;
/// Environment-driven configuration management.
pub mod config;
/// PDF text extraction.
pub mod extract;
/// Structured logging and tracing setup.
pub mod logging;
/// Request and chunk counters.
pub mod metrics;
/// Progress delivery to requesters.
pub mod notify;
/// Document summarization pipeline.
pub mod processing;
/// Summarization provider abstraction and the Ollama client.
pub mod summarization;

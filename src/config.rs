use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::processing::{ChunkerSettings, OrchestratorSettings, ReductionPolicy};

/// Default instruction applied when a user has not configured a custom prompt.
pub const DEFAULT_INSTRUCTION: &str = "Please provide a comprehensive yet concise summary of the following text.
Focus on the main ideas, key points, and important conclusions.
Make the summary informative and well-structured.

Text to summarize:
{text}

SUMMARY:";

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Unit used to measure chunk sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkUnit {
    /// Unicode scalar values.
    Chars,
    /// Tokens as counted by the configured tokenizer.
    Tokens,
}

impl FromStr for ChunkUnit {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chars" | "characters" => Ok(Self::Chars),
            "tokens" => Ok(Self::Tokens),
            _ => Err(()),
        }
    }
}

/// Runtime configuration for the summarizer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Ollama runtime used for summaries.
    pub ollama_url: String,
    /// Model identifier passed to the summarization provider.
    pub summarization_model: String,
    /// Sampling temperature requested from the provider.
    pub summarization_temperature: f32,
    /// Maximum size of a chunk, in [`Config::chunk_unit`] units.
    pub chunk_max_units: usize,
    /// Trailing units of the previous chunk repeated at the start of the next one.
    pub chunk_overlap_units: usize,
    /// Unit used for chunk budgets.
    pub chunk_unit: ChunkUnit,
    /// Tokenizer model or encoding name used when `chunk_unit` is `tokens`.
    pub chunk_tokenizer_model: String,
    /// How far (in characters) the chunker backtracks looking for a sentence end.
    pub chunk_sentence_window: usize,
    /// Retries granted to each summarization call after the first attempt.
    pub max_retries: usize,
    /// Base delay of the exponential retry backoff.
    pub retry_base_delay_ms: u64,
    /// Fraction of chunks allowed to fail before the request is abandoned.
    pub partial_failure_ratio: f64,
    /// Maximum number of chunk summaries in flight for one request.
    pub max_concurrency: usize,
    /// Timeout applied to each extractor and summarization call.
    pub call_timeout_secs: u64,
    /// Largest accepted upload, in bytes.
    pub max_document_bytes: u64,
    /// Instruction used for users without a custom prompt.
    pub default_instruction: String,
    /// Directory where uploads are staged until the request finishes.
    pub storage_dir: String,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// Length limit of the rendered summary message.
    pub max_message_chars: usize,
    /// Log file path; `logs/pdf-summarizer.log` when unset.
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_url: "http://127.0.0.1:11434".into(),
            summarization_model: "llama3.1".into(),
            summarization_temperature: 0.3,
            chunk_max_units: 4000,
            chunk_overlap_units: 200,
            chunk_unit: ChunkUnit::Chars,
            chunk_tokenizer_model: "cl100k_base".into(),
            chunk_sentence_window: 200,
            max_retries: 2,
            retry_base_delay_ms: 500,
            partial_failure_ratio: 0.2,
            max_concurrency: 4,
            call_timeout_secs: 120,
            max_document_bytes: 20 * 1024 * 1024,
            default_instruction: DEFAULT_INSTRUCTION.into(),
            storage_dir: "downloads".into(),
            server_port: None,
            max_message_chars: 4000,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let partial_failure_ratio: f64 =
            parse_env("SUMMARY_PARTIAL_FAILURE_RATIO")?.unwrap_or(defaults.partial_failure_ratio);
        if !(0.0..=1.0).contains(&partial_failure_ratio) {
            return Err(ConfigError::InvalidValue(
                "SUMMARY_PARTIAL_FAILURE_RATIO".into(),
            ));
        }
        let chunk_max_units = parse_env("CHUNK_MAX_UNITS")?.unwrap_or(defaults.chunk_max_units);
        if chunk_max_units == 0 {
            return Err(ConfigError::InvalidValue("CHUNK_MAX_UNITS".into()));
        }

        Ok(Self {
            ollama_url: load_env_optional("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            summarization_model: load_env_optional("SUMMARIZATION_MODEL")
                .unwrap_or(defaults.summarization_model),
            summarization_temperature: parse_env("SUMMARIZATION_TEMPERATURE")?
                .unwrap_or(defaults.summarization_temperature),
            chunk_max_units,
            chunk_overlap_units: parse_env("CHUNK_OVERLAP_UNITS")?
                .unwrap_or(defaults.chunk_overlap_units),
            chunk_unit: load_env_optional("CHUNK_UNIT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|()| ConfigError::InvalidValue("CHUNK_UNIT".into()))
                })
                .transpose()?
                .unwrap_or(defaults.chunk_unit),
            chunk_tokenizer_model: load_env_optional("CHUNK_TOKENIZER_MODEL")
                .unwrap_or(defaults.chunk_tokenizer_model),
            chunk_sentence_window: parse_env("CHUNK_SENTENCE_WINDOW")?
                .unwrap_or(defaults.chunk_sentence_window),
            max_retries: parse_env("SUMMARY_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            retry_base_delay_ms: parse_env("SUMMARY_RETRY_BASE_DELAY_MS")?
                .unwrap_or(defaults.retry_base_delay_ms),
            partial_failure_ratio,
            max_concurrency: parse_env::<usize>("SUMMARY_MAX_CONCURRENCY")?
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            call_timeout_secs: parse_env("CALL_TIMEOUT_SECS")?
                .unwrap_or(defaults.call_timeout_secs),
            max_document_bytes: parse_env("MAX_DOCUMENT_BYTES")?
                .unwrap_or(defaults.max_document_bytes),
            default_instruction: load_env_optional("DEFAULT_INSTRUCTION")
                .unwrap_or(defaults.default_instruction),
            storage_dir: load_env_optional("STORAGE_DIR").unwrap_or(defaults.storage_dir),
            server_port: parse_env("SERVER_PORT")?,
            max_message_chars: parse_env("SUMMARY_MAX_MESSAGE_CHARS")?
                .unwrap_or(defaults.max_message_chars),
            log_file: load_env_optional("PDF_SUMMARIZER_LOG_FILE"),
        })
    }

    /// Chunker settings derived from this configuration.
    pub fn chunker_settings(&self) -> ChunkerSettings {
        ChunkerSettings {
            max_units: self.chunk_max_units,
            overlap: self.chunk_overlap_units,
            sentence_window: self.chunk_sentence_window,
            unit: self.chunk_unit,
            tokenizer_model: self.chunk_tokenizer_model.clone(),
        }
    }

    /// Retry, timeout, and failure-tolerance policy for the reduction pipeline.
    pub fn reduction_policy(&self) -> ReductionPolicy {
        ReductionPolicy {
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            partial_failure_ratio: self.partial_failure_ratio,
            max_concurrency: self.max_concurrency,
            call_timeout: self.call_timeout(),
        }
    }

    /// Orchestrator settings derived from this configuration.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            call_timeout: self.call_timeout(),
            max_document_bytes: self.max_document_bytes,
        }
    }

    /// Per-call timeout for slow I/O collaborators.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    Ok(CONFIG.get_or_init(|| config))
}

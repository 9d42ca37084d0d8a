//! Error types for the Rosin verification core.
//!
//! Uses `thiserror` with one enum per subsystem. Credential errors live
//! next to the stores in `credentials.rs`.

use crate::types::Provider;

/// Longest error message surfaced to a user-facing event.
pub const MAX_DISPLAY_ERROR_CHARS: usize = 200;

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Missing API key for {provider}")]
    MissingCredential { provider: Provider },

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: Provider,
        status: u16,
        message: String,
    },

    #[error("API request failed: {message}")]
    Request { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Request cancelled")]
    Cancelled,
}

impl LlmError {
    /// The error rendered for a pipeline event, truncated for display.
    pub fn display_message(&self) -> String {
        truncate_chars(&self.to_string(), MAX_DISPLAY_ERROR_CHARS)
    }
}

/// Errors from running the verification pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Stage {stage} failed: {message}")]
    StageFailed { stage: usize, message: String },

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

/// Truncate to at most `max` characters without splitting a code point.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

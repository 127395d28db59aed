// src/error.rs
// Standardized error types for the engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Batch metadata attached to an LLM failure during chronicle generation.
///
/// Lets the caller (and ultimately the UI) navigate to the offending batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchMeta {
    pub message_ids: Vec<String>,
    pub start_time: i64,
    pub end_time: i64,
}

/// Sub-codes for LLM failures, surfaced after the client's own retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorCode {
    Empty,
    Safety,
    Timeout,
    RateLimited,
    Unknown,
}

impl LlmErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Safety => "safety",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unknown => "unknown",
        }
    }
}

/// LLM failure with a recognizable code and a user-facing message.
#[derive(Debug, Clone, Error)]
#[error("LLM error ({}): {user_message}", .code.as_str())]
pub struct LlmError {
    pub code: LlmErrorCode,
    pub user_message: String,
    /// Attached by the chronicle generator before surfacing.
    pub batch_meta: Option<BatchMeta>,
}

impl LlmError {
    pub fn new(code: LlmErrorCode, user_message: impl Into<String>) -> Self {
        Self {
            code,
            user_message: user_message.into(),
            batch_meta: None,
        }
    }

    pub fn empty(user_message: impl Into<String>) -> Self {
        Self::new(LlmErrorCode::Empty, user_message)
    }

    pub fn timeout(user_message: impl Into<String>) -> Self {
        Self::new(LlmErrorCode::Timeout, user_message)
    }

    pub fn with_batch_meta(mut self, meta: BatchMeta) -> Self {
        self.batch_meta = Some(meta);
        self
    }
}

/// Main error type for the engine.
#[derive(Error, Debug)]
pub enum WeaveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using WeaveError
pub type Result<T> = std::result::Result<T, WeaveError>;

impl From<String> for WeaveError {
    fn from(s: String) -> Self {
        WeaveError::Other(s)
    }
}

impl From<tokio::task::JoinError> for WeaveError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            WeaveError::Cancelled
        } else {
            WeaveError::Other(err.to_string())
        }
    }
}

impl WeaveError {
    /// Stable code string for job records and HTTP error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Invalid(_) => "invalid",
            Self::Conflict(_) => "conflict",
            Self::AccessDenied(_) => "access_denied",
            Self::Llm(e) => e.code.as_str(),
            Self::Cancelled => "cancelled",
            Self::Db(_) => "db",
            Self::Io(_) => "io",
            Self::Http(_) => "http",
            Self::Embedding(_) => "embedding",
            Self::Json(_) => "json",
            Self::Config(_) => "config",
            Self::Other(_) | Self::Anyhow(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_error_display_includes_code() {
        let err = LlmError::new(LlmErrorCode::Timeout, "the model timed out");
        assert_eq!(err.to_string(), "LLM error (timeout): the model timed out");
    }

    #[test]
    fn batch_meta_round_trips_through_weave_error() {
        let meta = BatchMeta {
            message_ids: vec!["a".into(), "b".into()],
            start_time: 10,
            end_time: 20,
        };
        let err: WeaveError = LlmError::empty("no output").with_batch_meta(meta.clone()).into();
        match err {
            WeaveError::Llm(inner) => assert_eq!(inner.batch_meta, Some(meta)),
            other => panic!("expected Llm variant, got {other}"),
        }
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(WeaveError::NotFound("x".into()).error_code(), "not_found");
        assert_eq!(WeaveError::AccessDenied("x".into()).error_code(), "access_denied");
        assert_eq!(
            WeaveError::Llm(LlmError::new(LlmErrorCode::RateLimited, "slow down")).error_code(),
            "rate_limited"
        );
    }
}

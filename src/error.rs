//! # Errors
//!
//! One error type for the whole matching core. The variants follow the way callers
//! are expected to react:
//!
//! - [`MatchError::InvalidArgument`]: bad local input (blank query, malformed
//!   identity). Re-prompt the user.
//! - [`MatchError::NotFound`]: the vehicle disappeared between trigger and sync.
//!   Log and skip.
//! - [`MatchError::UpstreamUnavailable`] / [`MatchError::Upstream`]: the embedding
//!   or chat backend is down, rejected the request or rate-limited us. The caller
//!   decides whether to retry; nothing in this crate retries on its own.
//! - [`MatchError::SearchBackend`]: the vector store failed to answer a query.
//! - [`MatchError::DimensionMismatch`]: query and corpus vectors come from
//!   different embedding spaces.
//! - [`MatchError::StreamUnavailable`]: the chat backend accepted the request but
//!   there is no body to stream, or the transport died mid-stream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream rejected the request ({status}){}", detail_suffix(.detail))]
    Upstream { status: u16, detail: Option<String> },

    #[error("search backend error: {0}")]
    SearchBackend(String),

    #[error("embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MatchError>;

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl MatchError {
    /// Whether a caller could reasonably try the same call again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            MatchError::UpstreamUnavailable(_) | MatchError::StreamUnavailable(_) => true,
            MatchError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<diesel::result::Error> for MatchError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => MatchError::NotFound("row not found".to_string()),
            other => MatchError::Storage(other.to_string()),
        }
    }
}

impl From<diesel::ConnectionError> for MatchError {
    fn from(err: diesel::ConnectionError) -> Self {
        MatchError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for MatchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => MatchError::Upstream {
                status: status.as_u16(),
                detail: Some(err.to_string()),
            },
            None => MatchError::UpstreamUnavailable(err.to_string()),
        }
    }
}

//! Upstream client errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimit,

    /// The bearer token was rejected.
    #[error("Authentication failed")]
    Unauthorized,

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Empty response from model")]
    EmptyResponse,
}

impl UpstreamError {
    /// Transport failures, rate limits and server errors may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Http(_) | UpstreamError::RateLimit => true,
            UpstreamError::Api { status, .. } => *status >= 500,
            UpstreamError::Unauthorized | UpstreamError::Json(_) | UpstreamError::EmptyResponse => {
                false
            }
        }
    }
}

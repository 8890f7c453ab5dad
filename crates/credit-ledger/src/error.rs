//! Metering error types.

use thiserror::Error;

/// Errors that can occur in the metering system.
#[derive(Error, Debug)]
pub enum MeteringError {
    /// The remote balance authority could not be reached and no usable cache entry exists.
    #[error("Balance authority unavailable: {0}")]
    RemoteUnavailable(String),

    /// A ledger write could not land after bounded retries. The change was not applied.
    #[error("Ledger update for {user_id} not applied after {attempts} attempts")]
    ConcurrencyExhausted { user_id: String, attempts: u32 },

    /// The storage layer reported a uniqueness conflict on insert.
    #[error("Record already exists: {0}")]
    Conflict(String),

    /// Storage I/O error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for MeteringError {
    fn from(e: std::io::Error) -> Self {
        MeteringError::Storage(e.to_string())
    }
}

/// Errors returned by the remote balance authority client.
///
/// These never cross the metering boundary as-is: the balance cache and
/// spend recorder convert them into [`MeteringError::RemoteUnavailable`].
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Authority error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<RemoteError> for MeteringError {
    fn from(e: RemoteError) -> Self {
        MeteringError::RemoteUnavailable(e.to_string())
    }
}

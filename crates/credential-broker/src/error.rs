//! Credential error types.

use thiserror::Error;

/// Errors that can occur while managing upstream credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No usable credential chain. The user must re-authenticate.
    #[error("Re-authentication required: {reason}")]
    AuthRequired { reason: String },

    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    /// The token endpoint rejected the refresh or returned an unusable body.
    #[error("Token exchange failed: {message}")]
    Exchange {
        status: Option<u16>,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CredentialError {
    pub fn auth_required(reason: impl Into<String>) -> Self {
        CredentialError::AuthRequired {
            reason: reason.into(),
        }
    }

    pub fn is_auth_required(&self) -> bool {
        matches!(self, CredentialError::AuthRequired { .. })
    }
}

impl From<std::io::Error> for CredentialError {
    fn from(e: std::io::Error) -> Self {
        CredentialError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for CredentialError {
    fn from(e: serde_json::Error) -> Self {
        CredentialError::Store(format!("JSON serialization error: {}", e))
    }
}

impl From<aes_gcm::Error> for CredentialError {
    fn from(_: aes_gcm::Error) -> Self {
        CredentialError::Encryption("AES-GCM encryption/decryption failed".to_string())
    }
}

impl From<reqwest::Error> for CredentialError {
    fn from(e: reqwest::Error) -> Self {
        CredentialError::Exchange {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

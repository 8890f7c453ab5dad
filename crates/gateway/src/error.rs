//! Gateway error types and the codes surfaced to clients.

use credential_broker::CredentialError;
use credit_ledger::{format_credits, MeteringError, MicroCredits};
use serde::Serialize;
use thiserror::Error;
use upstream_client::UpstreamError;

/// Structured code returned with every failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    InsufficientBalance,
    ServiceUnavailable,
    ConcurrencyExhausted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ConcurrencyExhausted => "CONCURRENCY_EXHAUSTED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main gateway error type.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Insufficient balance: required {required}, available {balance}")]
    InsufficientBalance {
        balance: MicroCredits,
        required: MicroCredits,
    },

    #[error("Credential error: {0}")]
    Credential(CredentialError),

    #[error("Metering error: {0}")]
    Metering(#[from] MeteringError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::AuthRequired(_) | GatewayError::Upstream(UpstreamError::Unauthorized) => {
                ErrorCode::AuthRequired
            }
            GatewayError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            GatewayError::Metering(MeteringError::ConcurrencyExhausted { .. }) => {
                ErrorCode::ConcurrencyExhausted
            }
            _ => ErrorCode::ServiceUnavailable,
        }
    }

    /// Message safe to show the end user. Details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::InsufficientBalance { balance, required } => format!(
                "Insufficient balance: this request needs {}, {} available.",
                format_credits(*required),
                format_credits(*balance)
            ),
            _ if self.code() == ErrorCode::AuthRequired => {
                "Your session has expired. Please sign in again.".to_string()
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<CredentialError> for GatewayError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::AuthRequired { reason } => GatewayError::AuthRequired(reason),
            other => GatewayError::Credential(other),
        }
    }
}

/// Result type alias for gateway errors.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            GatewayError::from(CredentialError::auth_required("expired")).code(),
            ErrorCode::AuthRequired
        );
        assert_eq!(
            GatewayError::from(UpstreamError::Unauthorized).code(),
            ErrorCode::AuthRequired
        );
        assert_eq!(
            GatewayError::from(MeteringError::ConcurrencyExhausted {
                user_id: "u".into(),
                attempts: 10
            })
            .code(),
            ErrorCode::ConcurrencyExhausted
        );
        assert_eq!(
            GatewayError::from(MeteringError::RemoteUnavailable("down".into())).code(),
            ErrorCode::ServiceUnavailable
        );
        assert_eq!(
            GatewayError::from(CredentialError::Store("disk".into())).code(),
            ErrorCode::ServiceUnavailable
        );
        assert_eq!(
            GatewayError::from(UpstreamError::RateLimit).code(),
            ErrorCode::ServiceUnavailable
        );
    }

    #[test]
    fn test_insufficient_balance_code() {
        let err = GatewayError::InsufficientBalance {
            balance: 70_000_000,
            required: 80_000_000,
        };
        assert_eq!(err.code(), ErrorCode::InsufficientBalance);
        assert_eq!(
            GatewayError::from(MeteringError::Conflict("u".into())).code(),
            ErrorCode::ServiceUnavailable
        );
    }

    #[test]
    fn test_user_messages_hide_details() {
        let auth = GatewayError::AuthRequired("refresh token expired".into());
        assert!(auth.user_message().contains("sign in again"));
        assert!(!auth.user_message().contains("refresh token"));

        let internal = GatewayError::Metering(MeteringError::Storage("/var/lib/x".into()));
        assert_eq!(internal.user_message(), "Something went wrong. Please try again.");
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ConcurrencyExhausted).unwrap();
        assert_eq!(json, "\"CONCURRENCY_EXHAUSTED\"");
        assert_eq!(ErrorCode::AuthRequired.to_string(), "AUTH_REQUIRED");
    }
}

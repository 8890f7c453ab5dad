//! Credential model.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Unique identifier for a user.
pub type UserId = String;

/// Which half of a credential pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Access,
    Refresh,
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialKind::Access => write!(f, "access"),
            CredentialKind::Refresh => write!(f, "refresh"),
        }
    }
}

/// A stored credential. The secret is held only as ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: UserId,
    pub provider: String,
    pub kind: CredentialKind,
    /// Base64 `nonce || ciphertext` produced by [`crate::SecretCipher`].
    pub ciphertext: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        user_id: impl Into<UserId>,
        provider: impl Into<String>,
        kind: CredentialKind,
        ciphertext: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            provider: provider.into(),
            kind,
            ciphertext,
            expires_at,
        }
    }

    /// Usable at `now` with at least `skew` to spare.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: ChronoDuration) -> bool {
        now + skew < self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A decrypted access token ready to be sent upstream.
///
/// Debug output is redacted by `SecretString`.
#[derive(Debug, Clone)]
pub struct BearerToken(SecretString);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<SecretString> for BearerToken {
    fn from(secret: SecretString) -> Self {
        Self(secret)
    }
}

fn default_expires_in() -> u64 {
    3600
}

/// Successful token-endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: SecretString,
    /// Access token lifetime in seconds.
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    /// Present only when the provider rotates refresh tokens.
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    /// Refresh token lifetime in seconds, when the provider reports it.
    #[serde(default)]
    pub refresh_token_expires_in: Option<u64>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>, expires_in: u64) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            expires_in,
            refresh_token: None,
            refresh_token_expires_in: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::new(refresh_token.into()));
        self
    }
}

/// Error body returned by OAuth token endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

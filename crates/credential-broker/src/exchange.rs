//! Refresh-token grant against the OAuth token endpoint.

use crate::config::RefreshConfig;
use crate::error::CredentialError;
use crate::types::{TokenErrorBody, TokenGrant};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Exchanges a refresh secret for a new access token.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, CredentialError>;
}

/// `grant_type=refresh_token` client.
#[derive(Clone)]
pub struct OAuthTokenClient {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: Option<SecretString>,
}

impl OAuthTokenClient {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.map(SecretString::new),
        })
    }

    pub fn from_config(config: &RefreshConfig) -> Result<Self, CredentialError> {
        Self::new(
            &config.token_url,
            &config.client_id,
            config.client_secret.clone(),
            config.exchange_timeout,
        )
    }
}

#[async_trait]
impl TokenExchange for OAuthTokenClient {
    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant, CredentialError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose_secret().as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose_secret().as_str()));
        }

        let response = self.client.post(&self.token_url).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            debug!("Token endpoint returned {}", status);
            return serde_json::from_str(&body).map_err(|e| CredentialError::Exchange {
                status: Some(status.as_u16()),
                message: format!("Unreadable token response: {}", e),
            });
        }

        let message = match serde_json::from_str::<TokenErrorBody>(&body) {
            Ok(err) => match err.error_description {
                Some(description) => format!("{}: {}", err.error, description),
                None => err.error,
            },
            Err(_) => body,
        };
        warn!("Token endpoint rejected refresh: {} {}", status, message);

        Err(CredentialError::Exchange {
            status: Some(status.as_u16()),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, secret: Option<&str>) -> OAuthTokenClient {
        OAuthTokenClient::new(
            format!("{}/oauth/token", server.uri()),
            "gateway",
            secret.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .and(body_string_contains("client_secret=shh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "token_type": "Bearer",
                "expires_in": 900,
                "refresh_token": "rt-2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("shh"));
        let grant = client
            .refresh(&SecretString::new("rt-1".into()))
            .await
            .unwrap();

        assert_eq!(grant.access_token.expose_secret(), "at-2");
        assert_eq!(grant.expires_in, 900);
        assert_eq!(
            grant.refresh_token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("rt-2")
        );
    }

    #[tokio::test]
    async fn test_invalid_grant() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let result = client.refresh(&SecretString::new("rt".into())).await;

        match result {
            Err(CredentialError::Exchange { status, message }) => {
                assert_eq!(status, Some(400));
                assert_eq!(message, "invalid_grant: refresh token revoked");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_malformed_success_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = client_for(&server, None);
        let result = client.refresh(&SecretString::new("rt".into())).await;
        assert!(matches!(result, Err(CredentialError::Exchange { .. })));
    }
}

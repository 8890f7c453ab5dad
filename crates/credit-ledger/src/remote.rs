//! Client for the remote metering authority.

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::types::{to_credits, to_micros, MicroCredits};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Acknowledgement of a usage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageReceipt {
    /// Balance after the debit, if the authority returns one.
    pub balance: Option<MicroCredits>,
}

/// The external source of truth for balances.
#[async_trait]
pub trait BalanceAuthority: Send + Sync {
    /// Current balance of a user. Idempotent.
    async fn get_balance(&self, user_id: &str) -> Result<MicroCredits, RemoteError>;

    /// Debit already-reserved capacity. At-least-once delivery is acceptable.
    async fn report_usage(
        &self,
        user_id: &str,
        credits: MicroCredits,
        description: &str,
    ) -> Result<UsageReceipt, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    credits: f64,
}

#[derive(Debug, Serialize)]
struct UsageRequest<'a> {
    user_id: &'a str,
    credits: f64,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    balance: Option<f64>,
}

/// HTTP implementation of [`BalanceAuthority`].
///
/// The API key is stored using `SecretString` to prevent accidental
/// exposure in logs or debug output.
#[derive(Clone)]
pub struct HttpBalanceAuthority {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpBalanceAuthority {
    /// Create a new authority client.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: SecretString::new(api_key.into()),
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteError> {
        Self::new(&config.api_key, &config.base_url, config.timeout)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            debug!("Authority response: {}", preview(&body));
            serde_json::from_str(&body).map_err(RemoteError::from)
        } else {
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!("Balance authority rate limit exceeded");
            }
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".into());
            Err(RemoteError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// First 200 characters of a body, cut on a char boundary.
fn preview(body: &str) -> &str {
    body.char_indices().nth(200).map_or(body, |(i, _)| &body[..i])
}

fn map_transport(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Http(e)
    }
}

#[async_trait]
impl BalanceAuthority for HttpBalanceAuthority {
    #[instrument(skip(self))]
    async fn get_balance(&self, user_id: &str) -> Result<MicroCredits, RemoteError> {
        let response = self
            .client
            .get(format!(
                "{}/balances/{}",
                self.base_url,
                urlencoding::encode(user_id)
            ))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .send()
            .await
            .map_err(map_transport)?;

        let balance: BalanceResponse = self.handle_response(response).await?;
        Ok(to_micros(balance.credits))
    }

    #[instrument(skip(self, description))]
    async fn report_usage(
        &self,
        user_id: &str,
        credits: MicroCredits,
        description: &str,
    ) -> Result<UsageReceipt, RemoteError> {
        let request = UsageRequest {
            user_id,
            credits: to_credits(credits),
            description,
        };

        let response = self
            .client
            .post(format!("{}/usage", self.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await
            .map_err(map_transport)?;

        let ack: UsageResponse = self.handle_response(response).await?;
        Ok(UsageReceipt {
            balance: ack.balance.map(to_micros),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_client(mock_server: &MockServer) -> HttpBalanceAuthority {
        HttpBalanceAuthority::new("test-api-key", mock_server.uri(), Duration::from_millis(500))
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_balance_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/balances/user%401"))
            .and(header("Authorization", "Bearer test-api-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "credits": 100.5 })),
            )
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let balance = client.get_balance("user@1").await.unwrap();
        assert_eq!(balance, 100_500_000);
    }

    #[tokio::test]
    async fn test_get_balance_server_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let result = client.get_balance("user-1").await;
        assert!(matches!(result, Err(RemoteError::Api { status: 503, .. })));
    }

    #[test]
    fn test_preview_cuts_on_char_boundary() {
        let body = "é".repeat(300);
        assert_eq!(preview(&body).chars().count(), 200);
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn test_multibyte_body_with_debug_logging() {
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_test_writer()
                .finish(),
        );
        let mock_server = MockServer::start().await;

        // Byte 200 falls inside a three-byte character.
        let note = format!("é{}", "日".repeat(100));
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "note": note, "credits": 5.0 })),
            )
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let balance = client.get_balance("user-1").await.unwrap();
        assert_eq!(balance, 5_000_000);
    }

    #[tokio::test]
    async fn test_get_balance_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "credits": 1.0 }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let result = client.get_balance("user-1").await;
        assert!(matches!(result, Err(RemoteError::Timeout)));
    }

    #[tokio::test]
    async fn test_report_usage() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/usage"))
            .and(body_json(serde_json::json!({
                "user_id": "user-1",
                "credits": 1.25,
                "description": "gpt-4o completion"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "balance": 98.75 })),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let receipt = client
            .report_usage("user-1", 1_250_000, "gpt-4o completion")
            .await
            .unwrap();
        assert_eq!(receipt.balance, Some(98_750_000));
    }

    #[tokio::test]
    async fn test_report_usage_without_balance() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/usage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server);
        let receipt = client.report_usage("user-1", 10_000, "x").await.unwrap();
        assert_eq!(receipt.balance, None);
    }
}

//! Chat completions HTTP client.

use crate::error::UpstreamError;
use crate::types::*;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Default retry configuration
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 5000;

/// OpenAI-compatible chat client.
///
/// Holds no credentials of its own: each call carries the bearer token of
/// the user it is made for.
#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    base_url: String,
    model: String,
}

impl ChatClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// Get the configured model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a chat completion request.
    #[instrument(skip(self, bearer, messages), fields(message_count = messages.len()))]
    pub async fn chat(
        &self,
        bearer: &str,
        messages: Vec<Message>,
        max_tokens: Option<u32>,
    ) -> Result<Completion, UpstreamError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: None,
            max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", bearer))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let chat_response = self.handle_response::<ChatResponse>(response).await?;
        let usage = chat_response.usage;
        let model = if chat_response.model.is_empty() {
            self.model.clone()
        } else {
            chat_response.model
        };

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or(UpstreamError::EmptyResponse)?;
        let content = choice
            .message
            .content
            .filter(|content| !content.is_empty())
            .ok_or(UpstreamError::EmptyResponse)?;

        Ok(Completion {
            content,
            model,
            finish_reason: choice.finish_reason,
            usage,
        })
    }

    /// Send a chat completion request with automatic retry and exponential backoff.
    ///
    /// Retries transient errors (network issues, rate limits, 5xx) up to
    /// `max_retries` times. A rejected bearer token is returned immediately.
    #[instrument(skip(self, bearer, messages), fields(message_count = messages.len()))]
    pub async fn chat_with_retry(
        &self,
        bearer: &str,
        messages: Vec<Message>,
        max_tokens: Option<u32>,
        max_retries: Option<u32>,
    ) -> Result<Completion, UpstreamError> {
        let max_retries = max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let mut backoff_ms = DEFAULT_INITIAL_BACKOFF_MS;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} after {}ms backoff", attempt, backoff_ms);
                sleep(Duration::from_millis(backoff_ms)).await;
                // Exponential backoff with cap
                backoff_ms = (backoff_ms * 2).min(DEFAULT_MAX_BACKOFF_MS);
            }

            match self.chat(bearer, messages.clone(), max_tokens).await {
                Ok(completion) => return Ok(completion),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("Chat request failed (attempt {}): {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(UpstreamError::Api {
            status: 0,
            message: "Max retries exceeded".into(),
        }))
    }

    /// Handle HTTP response, converting errors appropriately.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, UpstreamError> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            debug!("Response body: {}", preview(&body));
            serde_json::from_str(&body).map_err(UpstreamError::from)
        } else {
            Err(self.extract_error(response).await)
        }
    }

    /// Extract error information from failed response.
    async fn extract_error(&self, response: reqwest::Response) -> UpstreamError {
        let status = response.status();

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Rate limit exceeded");
                UpstreamError::RateLimit
            }
            StatusCode::UNAUTHORIZED => {
                warn!("Upstream rejected bearer token");
                UpstreamError::Unauthorized
            }
            _ => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".into());
                UpstreamError::Api {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }
}

/// First 200 characters of a body, cut on a char boundary.
pub(crate) fn preview(body: &str) -> &str {
    body.char_indices().nth(200).map_or(body, |(i, _)| &body[..i])
}

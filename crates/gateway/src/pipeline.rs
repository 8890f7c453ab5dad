//! Per-request pipeline: credential, admission, upstream call, charge.

use crate::error::{GatewayError, GatewayResult};
use credential_broker::{BearerToken, RefreshCoordinator};
use credit_ledger::{Admission, MicroCredits, SpendContext, SpendRecorder, TokenUsage};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use upstream_client::{ChatClient, Completion, Message, UpstreamError};

/// One chat turn submitted on behalf of a user.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_context")]
    pub context: SpendContext,
}

fn default_context() -> SpendContext {
    SpendContext::Message
}

impl GatewayRequest {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            max_tokens: None,
            context: default_context(),
        }
    }
}

/// A delivered completion and what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReply {
    pub content: String,
    pub model: String,
    pub credits_charged: MicroCredits,
    /// Balance after the charge, when the active ledger reports one.
    pub balance: Option<MicroCredits>,
}

pub struct Pipeline {
    credentials: RefreshCoordinator,
    metering: Arc<SpendRecorder>,
    upstream: ChatClient,
    system_prompt: Option<String>,
    max_retries: u32,
}

impl Pipeline {
    pub fn new(
        credentials: RefreshCoordinator,
        metering: Arc<SpendRecorder>,
        upstream: ChatClient,
    ) -> Self {
        Self {
            credentials,
            metering,
            upstream,
            system_prompt: None,
            max_retries: 2,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn credentials(&self) -> &RefreshCoordinator {
        &self.credentials
    }

    pub fn metering(&self) -> &Arc<SpendRecorder> {
        &self.metering
    }

    /// Run one request end to end.
    ///
    /// The reservation taken at admission is released once the charge has
    /// been recorded, or as soon as the request fails.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn handle(&self, request: &GatewayRequest) -> GatewayResult<GatewayReply> {
        let bearer = self.credentials.get_valid_credential(&request.user_id).await?;

        let required = self.metering.estimate(
            self.upstream.model(),
            request.message.chars().count(),
            request.max_tokens.map(u64::from),
        );
        let reservation = match self.metering.admit(&request.user_id, required).await? {
            Admission::Granted(reservation) => reservation,
            Admission::Insufficient { balance, required } => {
                info!("Rejected {}: balance {} < {}", request.user_id, balance, required);
                return Err(GatewayError::InsufficientBalance { balance, required });
            }
        };

        let result = self.complete_and_charge(request, bearer).await;
        self.metering.release(&reservation).await;
        result
    }

    async fn complete_and_charge(
        &self,
        request: &GatewayRequest,
        bearer: BearerToken,
    ) -> GatewayResult<GatewayReply> {
        let completion = self.complete(request, bearer).await?;

        let usage = match completion.usage {
            Some(usage) => TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
            None => {
                warn!("Upstream reported no usage; charging estimated tokens");
                TokenUsage::new(
                    approximate_tokens(&request.message),
                    approximate_tokens(&completion.content),
                )
            }
        };

        let outcome = self
            .metering
            .record_usage(&request.user_id, &completion.model, usage, request.context)
            .await?;

        Ok(GatewayReply {
            content: completion.content,
            model: completion.model,
            credits_charged: outcome.credits_charged,
            balance: outcome.new_balance,
        })
    }

    /// Call the upstream, retrying once with a fresh credential on 401.
    async fn complete(
        &self,
        request: &GatewayRequest,
        bearer: BearerToken,
    ) -> GatewayResult<Completion> {
        let messages = self.messages(&request.message);

        match self
            .upstream
            .chat_with_retry(
                bearer.expose(),
                messages.clone(),
                request.max_tokens,
                Some(self.max_retries),
            )
            .await
        {
            Err(UpstreamError::Unauthorized) => {
                warn!("Upstream rejected credential for {}, refreshing", request.user_id);
                self.credentials.invalidate(&request.user_id).await?;
                let bearer = self.credentials.get_valid_credential(&request.user_id).await?;
                Ok(self
                    .upstream
                    .chat_with_retry(
                        bearer.expose(),
                        messages,
                        request.max_tokens,
                        Some(self.max_retries),
                    )
                    .await?)
            }
            other => Ok(other?),
        }
    }

    fn messages(&self, user_message: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        messages.push(Message::user(user_message));
        messages
    }
}

/// Rough token count at ~4 characters per token.
fn approximate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

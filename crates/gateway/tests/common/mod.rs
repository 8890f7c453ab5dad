//! Common test utilities for integration tests.

#![allow(dead_code)]

use credential_broker::{
    MemoryCredentialStore, OAuthTokenClient, RefreshConfig, RefreshCoordinator, SecretCipher,
    TokenGrant,
};
use credit_ledger::{
    to_micros, ChargeTarget, LedgerConfig, LocalLedger, MemoryBalanceRepository,
    MemoryTransactionLog, PricingCalculator, PricingConfig, SpendRecorder,
};
use gateway::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use upstream_client::ChatClient;
use wiremock::MockServer;

pub const PASSPHRASE: &str = "integration-test-passphrase";
pub const MODEL: &str = "gpt-4o";

/// A pipeline wired to in-memory stores and mock HTTP collaborators.
pub struct Harness {
    pub pipeline: Pipeline,
    pub ledger: Arc<LocalLedger>,
    pub log: Arc<MemoryTransactionLog>,
    pub upstream: MockServer,
    pub idp: MockServer,
}

impl Harness {
    pub async fn start() -> Self {
        let upstream = MockServer::start().await;
        let idp = MockServer::start().await;

        let token_url = format!("{}/token", idp.uri());
        let refresh_config = RefreshConfig::new(&token_url, "gateway", PASSPHRASE);
        let exchange =
            OAuthTokenClient::new(&token_url, "gateway", None, Duration::from_secs(5)).unwrap();
        let credentials = RefreshCoordinator::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(exchange),
            SecretCipher::from_passphrase(PASSPHRASE),
            &refresh_config,
        );

        let log = Arc::new(MemoryTransactionLog::new());
        let ledger = Arc::new(
            LocalLedger::new(
                Arc::new(MemoryBalanceRepository::new()),
                LedgerConfig::default(),
            )
            .with_audit(log.clone()),
        );
        let metering = SpendRecorder::new(
            PricingCalculator::new(PricingConfig::default()),
            log.clone(),
            ChargeTarget::Local(ledger.clone()),
        );

        let client = ChatClient::new(upstream.uri(), MODEL, Duration::from_secs(5)).unwrap();
        let pipeline = Pipeline::new(credentials, Arc::new(metering), client).with_max_retries(0);

        Self {
            pipeline,
            ledger,
            log,
            upstream,
            idp,
        }
    }

    /// Store an access/refresh pair as if the user had just signed in.
    pub async fn sign_in(&self, user_id: &str, access: &str, refresh: &str) {
        let grant = TokenGrant::new(access, 3600).with_refresh_token(refresh);
        self.pipeline
            .credentials()
            .save_grant(user_id, &grant)
            .await
            .unwrap();
    }

    pub async fn fund(&self, user_id: &str, credits: f64) {
        self.ledger
            .apply_delta(user_id, to_micros(credits), None)
            .await
            .unwrap();
    }
}

/// OpenAI-style completion body with usage.
pub fn completion_body(content: &str, prompt_tokens: u64, completion_tokens: u64) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "gpt-4o-2024-08-06",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

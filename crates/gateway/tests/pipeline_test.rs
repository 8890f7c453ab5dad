//! End-to-end pipeline tests against mock upstream and token endpoints.

mod common;

use common::{completion_body, Harness};
use credential_broker::{CredentialKind, CredentialStore, TokenGrant};
use credit_ledger::TransactionLog;
use gateway::driver::{self, DriverResponse};
use gateway::{ErrorCode, GatewayError, GatewayRequest};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, ResponseTemplate};

const CREDIT: i64 = 1_000_000;

async fn mount_completion(harness: &Harness, bearer: &str, prompt: u64, completion: u64) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", format!("Bearer {}", bearer).as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body("Hi there!", prompt, completion)),
        )
        .mount(&harness.upstream)
        .await;
}

#[tokio::test]
async fn test_request_is_charged_from_reported_usage() {
    let harness = Harness::start().await;
    harness.sign_in("alice", "access-1", "refresh-1").await;
    harness.fund("alice", 100.0).await;
    // gpt-4o: 2.5 / 10 USD per million tokens
    mount_completion(&harness, "access-1", 100_000, 20_000).await;

    let reply = harness
        .pipeline
        .handle(&GatewayRequest::new("alice", "Hello"))
        .await
        .unwrap();

    assert_eq!(reply.content, "Hi there!");
    assert_eq!(reply.model, "gpt-4o-2024-08-06");
    assert_eq!(reply.credits_charged, 45 * CREDIT);
    assert_eq!(reply.balance, Some(55 * CREDIT));
    assert_eq!(harness.ledger.balance("alice").await.unwrap(), 55 * CREDIT);

    let transactions = harness.log.list("alice").await.unwrap();
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0].token_value, 25 * CREDIT);
    assert_eq!(transactions[1].token_value, 20 * CREDIT);
}

#[tokio::test]
async fn test_insufficient_balance_never_reaches_upstream() {
    let harness = Harness::start().await;
    harness.sign_in("bob", "access-1", "refresh-1").await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&harness.upstream)
        .await;

    let err = harness
        .pipeline
        .handle(&GatewayRequest::new("bob", "Hello"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GatewayError::InsufficientBalance { balance: 0, required } if required > 0
    ));
    assert_eq!(err.code(), ErrorCode::InsufficientBalance);
}

#[tokio::test]
async fn test_unknown_user_must_authenticate() {
    let harness = Harness::start().await;
    harness.fund("carol", 10.0).await;

    let err = harness
        .pipeline
        .handle(&GatewayRequest::new("carol", "Hello"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::AuthRequired);
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_and_retried_once() {
    let harness = Harness::start().await;
    harness.sign_in("dave", "access-1", "refresh-1").await;
    harness.fund("dave", 100.0).await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&harness.upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer access-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok", 1000, 1000)))
        .expect(1)
        .mount(&harness.upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-2",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&harness.idp)
        .await;

    let reply = assert_ok!(
        harness
            .pipeline
            .handle(&GatewayRequest::new("dave", "Hello"))
            .await
    );
    assert_eq!(reply.content, "ok");
}

#[tokio::test]
async fn test_failed_refresh_clears_credentials() {
    let harness = Harness::start().await;
    harness.sign_in("erin", "access-1", "refresh-1").await;
    harness.fund("erin", 100.0).await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&harness.upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "refresh token revoked"
        })))
        .expect(1)
        .mount(&harness.idp)
        .await;

    let err = assert_err!(
        harness
            .pipeline
            .handle(&GatewayRequest::new("erin", "Hello"))
            .await
    );
    assert_eq!(err.code(), ErrorCode::AuthRequired);

    let store = harness.pipeline.credentials().store();
    for kind in [CredentialKind::Access, CredentialKind::Refresh] {
        assert!(store.find("erin", kind, "openid").await.unwrap().is_none());
    }
    // Nothing was charged and no hold remains.
    assert_eq!(harness.ledger.balance("erin").await.unwrap(), 100 * CREDIT);
    assert!(harness.log.list("erin").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upstream_failure_is_not_charged() {
    let harness = Harness::start().await;
    harness.sign_in("frank", "access-1", "refresh-1").await;
    harness.fund("frank", 100.0).await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&harness.upstream)
        .await;

    let err = harness
        .pipeline
        .handle(&GatewayRequest::new("frank", "Hello"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ServiceUnavailable);
    assert_eq!(
        err.user_message(),
        "Something went wrong. Please try again."
    );
    assert_eq!(harness.ledger.balance("frank").await.unwrap(), 100 * CREDIT);
    assert!(harness.log.list("frank").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_share_one_refresh() {
    let harness = Harness::start().await;
    // Access credential already expired.
    harness
        .pipeline
        .credentials()
        .save_grant(
            "grace",
            &TokenGrant::new("stale", 0).with_refresh_token("refresh-1"),
        )
        .await
        .unwrap();
    harness.fund("grace", 100.0).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-2",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&harness.idp)
        .await;
    mount_completion(&harness, "access-2", 1000, 1000).await;

    let request = GatewayRequest::new("grace", "Hello");
    let pipeline = &harness.pipeline;
    let (a, b, c, d, e) = tokio::join!(
        pipeline.handle(&request),
        pipeline.handle(&request),
        pipeline.handle(&request),
        pipeline.handle(&request),
        pipeline.handle(&request),
    );

    for result in [a, b, c, d, e] {
        assert_eq!(result.unwrap().content, "Hi there!");
    }
    assert_eq!(pipeline.credentials().in_flight(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_failed_refresh() {
    let harness = Harness::start().await;
    harness
        .pipeline
        .credentials()
        .save_grant(
            "judy",
            &TokenGrant::new("stale", 0).with_refresh_token("refresh-1"),
        )
        .await
        .unwrap();
    harness.fund("judy", 100.0).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(serde_json::json!({ "error": "invalid_grant" }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&harness.idp)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&harness.upstream)
        .await;

    let request = GatewayRequest::new("judy", "Hello");
    let pipeline = &harness.pipeline;
    let (a, b, c, d, e) = tokio::join!(
        pipeline.handle(&request),
        pipeline.handle(&request),
        pipeline.handle(&request),
        pipeline.handle(&request),
        pipeline.handle(&request),
    );

    for result in [a, b, c, d, e] {
        assert_eq!(assert_err!(result).code(), ErrorCode::AuthRequired);
    }
    assert_eq!(pipeline.credentials().in_flight(), 0);
    let store = pipeline.credentials().store();
    for kind in [CredentialKind::Access, CredentialKind::Refresh] {
        assert!(store.find("judy", kind, "openid").await.unwrap().is_none());
    }
    assert_eq!(harness.ledger.balance("judy").await.unwrap(), 100 * CREDIT);
}

#[tokio::test]
async fn test_driver_line_round_trip() {
    let harness = Harness::start().await;
    harness.sign_in("heidi", "access-1", "refresh-1").await;
    harness.fund("heidi", 100.0).await;
    mount_completion(&harness, "access-1", 100_000, 20_000).await;

    let response = driver::handle_line(
        &harness.pipeline,
        r#"{"user_id":"heidi","message":"Hello","max_tokens":128}"#,
    )
    .await;
    assert_eq!(
        response,
        DriverResponse {
            ok: true,
            reply: Some("Hi there!".into()),
            code: None,
            message: None,
            credits_charged: Some(45.0),
        }
    );

    let rejected = driver::handle_line(&harness.pipeline, r#"{"user_id":"nobody","message":"x"}"#).await;
    assert!(!rejected.ok);
    assert_eq!(rejected.code, Some(ErrorCode::AuthRequired));

    let malformed = driver::handle_line(&harness.pipeline, "not json").await;
    assert!(!malformed.ok);
    assert_eq!(malformed.code, None);
    assert!(malformed.message.unwrap().starts_with("invalid request"));
}

#[tokio::test]
async fn test_driver_run_writes_one_line_per_request() {
    let harness = Harness::start().await;

    let input = b"{\"user_id\":\"ivan\",\"message\":\"a\"}\n\n{\"user_id\":\"ivan\",\"message\":\"b\"}\n";
    let mut output = Vec::new();
    driver::run(&harness.pipeline, &input[..], &mut output)
        .await
        .unwrap();

    let lines: Vec<serde_json::Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        assert_eq!(line["ok"], false);
        assert_eq!(line["code"], "AUTH_REQUIRED");
        assert!(line.get("reply").is_none());
    }
}

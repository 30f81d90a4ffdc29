use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use redline_llm::{
    AppState, CreditsConfig, GenerationChunk, GenerationRequest, GenerationStream, LedgerStore,
    ModelBackend, ModelRateConfig, ModelRegistry, Optimizer, ProviderError, RateTable,
    RequestLimits, TokenUsage, UsageStatus, router,
};
use serde_json::{Value, json};
use tower::util::ServiceExt;

#[derive(Clone, Copy)]
enum Step {
    Text(&'static str),
    Usage(u32, u32),
    Fail,
}

struct ScriptedBackend {
    script: Vec<Step>,
    refuse: bool,
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        _request: GenerationRequest,
    ) -> Result<GenerationStream, ProviderError> {
        if self.refuse {
            return Err(ProviderError::Connect("connection refused".to_string()));
        }
        let chunks: Vec<Result<GenerationChunk, ProviderError>> = self
            .script
            .iter()
            .map(|step| match step {
                Step::Text(text) => Ok(GenerationChunk {
                    text: (*text).to_string(),
                    usage: None,
                }),
                Step::Usage(input, output) => Ok(GenerationChunk {
                    text: String::new(),
                    usage: Some(TokenUsage {
                        input_tokens: Some(*input),
                        output_tokens: Some(*output),
                    }),
                }),
                Step::Fail => Err(ProviderError::InvalidStream(
                    "stream ended unexpectedly".to_string(),
                )),
            })
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}

fn streaming(script: Vec<Step>) -> ScriptedBackend {
    ScriptedBackend {
        script,
        refuse: false,
    }
}

fn refusing() -> ScriptedBackend {
    ScriptedBackend {
        script: Vec::new(),
        refuse: true,
    }
}

async fn build_app(backend: ScriptedBackend) -> (tempfile::TempDir, Router, LedgerStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = LedgerStore::new(dir.path().join("ledger.sqlite"));
    store.init().await.expect("init");

    let rates = Arc::new(
        RateTable::from_config(
            [(
                "gpt-4o-mini".to_string(),
                ModelRateConfig {
                    input_rate_per_1k: 0.000150,
                    output_rate_per_1k: 0.000600,
                },
            )],
            1_000_000,
        )
        .expect("rates"),
    );
    let registry = Arc::new(
        ModelRegistry::new(
            &rates,
            [(
                "gpt-4o-mini".to_string(),
                Arc::new(backend) as Arc<dyn ModelBackend>,
            )],
        )
        .expect("registry"),
    );
    let optimizer = Arc::new(Optimizer::new(
        store.clone(),
        rates,
        registry,
        RequestLimits::default(),
    ));
    let app = router(AppState::new(optimizer, CreditsConfig::default()));
    (dir, app, store)
}

async fn seed_user(store: &LedgerStore, balance_micro: i64) -> i64 {
    store
        .create_or_get_user("user@example.com", balance_micro)
        .await
        .expect("create user")
        .id
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).expect("json body")
}

fn optimize_body(user_id: i64) -> Value {
    json!({
        "user_id": user_id,
        "text": "teh quick brwon fox",
        "model": "gpt-4o-mini",
        "language": "en",
    })
}

#[tokio::test]
async fn optimize_streams_text_and_settles_the_ledger() {
    let backend = streaming(vec![
        Step::Text("The quick "),
        Step::Text("brown fox"),
        Step::Usage(1000, 500),
    ]);
    let (_dir, app, store) = build_app(backend).await;
    let user_id = seed_user(&store, 1_000).await;

    let response = app
        .clone()
        .oneshot(post_json("/v1/optimize", &optimize_body(user_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/plain; charset=utf-8")
    );
    // Reading the body to the end also waits out settlement: the chunk
    // channel closes only after billing finishes.
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"The quick brown fox");

    assert_eq!(store.balance(user_id).await.expect("balance"), 550);
    let usage = store.list_usage(user_id, 10).await.expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status, UsageStatus::Completed);
    assert_eq!(usage[0].credits_used, 450);
    assert!(store.reconcile(user_id).await.expect("reconcile").balanced);
}

#[tokio::test]
async fn optimize_with_no_credits_is_402_and_free() {
    let (_dir, app, store) = build_app(streaming(vec![Step::Text("unused")])).await;
    let user_id = seed_user(&store, 0).await;

    let response = app
        .oneshot(post_json("/v1/optimize", &optimize_body(user_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let value = json_body(response).await;
    assert_eq!(value["error"]["code"], "insufficient_credits");

    assert!(store.list_usage(user_id, 10).await.expect("usage").is_empty());
}

#[tokio::test]
async fn oversized_text_is_a_distinct_400() {
    let (_dir, app, store) = build_app(streaming(vec![Step::Text("unused")])).await;
    let user_id = seed_user(&store, 1_000).await;

    let mut body = optimize_body(user_id);
    body["text"] = Value::String("x".repeat(5000));
    let response = app.oneshot(post_json("/v1/optimize", &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = json_body(response).await;
    assert_eq!(value["error"]["code"], "text_too_long");
}

#[tokio::test]
async fn oversized_prompt_is_a_distinct_400() {
    let (_dir, app, store) = build_app(streaming(vec![Step::Text("unused")])).await;
    let user_id = seed_user(&store, 1_000).await;

    let mut body = optimize_body(user_id);
    body["custom_prompt"] = Value::String("x".repeat(2000));
    let response = app.oneshot(post_json("/v1/optimize", &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = json_body(response).await;
    assert_eq!(value["error"]["code"], "prompt_too_long");
}

#[tokio::test]
async fn unknown_model_is_a_400() {
    let (_dir, app, store) = build_app(streaming(vec![Step::Text("unused")])).await;
    let user_id = seed_user(&store, 1_000).await;

    let mut body = optimize_body(user_id);
    body["model"] = Value::String("gpt-5".to_string());
    let response = app.oneshot(post_json("/v1/optimize", &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = json_body(response).await;
    assert_eq!(value["error"]["code"], "unknown_model");
}

#[tokio::test]
async fn refused_backend_is_a_500_with_a_failed_usage_row() {
    let (_dir, app, store) = build_app(refusing()).await;
    let user_id = seed_user(&store, 1_000).await;

    let response = app
        .oneshot(post_json("/v1/optimize", &optimize_body(user_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let value = json_body(response).await;
    assert_eq!(value["error"]["code"], "provider_error");

    let usage = store.list_usage(user_id, 10).await.expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status, UsageStatus::Failed);
    assert_eq!(usage[0].credits_used, 0);
    assert_eq!(store.balance(user_id).await.expect("balance"), 1_000);
}

#[tokio::test]
async fn mid_stream_failure_truncates_the_body_and_never_bills() {
    let backend = streaming(vec![Step::Text("The quick "), Step::Fail]);
    let (_dir, app, store) = build_app(backend).await;
    let user_id = seed_user(&store, 1_000).await;

    let response = app
        .oneshot(post_json("/v1/optimize", &optimize_body(user_id)))
        .await
        .unwrap();
    // Streaming had already begun; the failure shows up as a short body.
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"The quick ");

    assert_eq!(store.balance(user_id).await.expect("balance"), 1_000);
    let usage = store.list_usage(user_id, 10).await.expect("usage");
    assert_eq!(usage[0].status, UsageStatus::Failed);
    let transactions = store.list_transactions(user_id, 10).await.expect("list");
    assert_eq!(transactions.len(), 1, "only the signup grant");
}

#[tokio::test]
async fn disconnecting_before_reading_still_settles() {
    let backend = streaming(vec![Step::Text("The quick brown fox"), Step::Usage(1000, 500)]);
    let (_dir, app, store) = build_app(backend).await;
    let user_id = seed_user(&store, 1_000).await;

    let response = app
        .clone()
        .oneshot(post_json("/v1/optimize", &optimize_body(user_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    drop(response);

    // Billing runs on a detached task; poll the ledger until it lands.
    let mut settled = false;
    for _ in 0..50 {
        if store.balance(user_id).await.expect("balance") == 550 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(settled, "disconnected client was not billed");
}

#[tokio::test]
async fn webhook_replays_credit_only_once() {
    let (_dir, app, store) = build_app(streaming(Vec::new())).await;
    let user_id = seed_user(&store, 0).await;

    let body = json!({
        "user_id": user_id,
        "credits": 500_000_000u64,
        "reference_id": "cs_test_abc123",
    });

    let response = app
        .clone()
        .oneshot(post_json("/v1/payments/webhook", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    assert_eq!(value["received"], true);
    assert_eq!(value["credits_balance"], 500_000_000u64);

    // The provider redelivers the same event.
    let response = app
        .clone()
        .oneshot(post_json("/v1/payments/webhook", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    assert_eq!(value["credits_balance"], 500_000_000u64);

    let transactions = store.list_transactions(user_id, 10).await.expect("list");
    assert_eq!(transactions.len(), 1);
    assert!(store.reconcile(user_id).await.expect("reconcile").balanced);
}

#[tokio::test]
async fn webhook_for_unknown_user_is_a_404() {
    let (_dir, app, _store) = build_app(streaming(Vec::new())).await;
    let body = json!({
        "user_id": 4242,
        "credits": 1000,
        "reference_id": "cs_test_missing",
    });
    let response = app
        .oneshot(post_json("/v1/payments/webhook", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let value = json_body(response).await;
    assert_eq!(value["error"]["code"], "unknown_user");
}

#[tokio::test]
async fn creating_a_user_grants_the_configured_starting_balance() {
    let (_dir, app, store) = build_app(streaming(Vec::new())).await;

    let response = app
        .clone()
        .oneshot(post_json("/v1/users", &json!({"email": "new@example.com"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    let user_id = value["id"].as_i64().expect("user id");
    // Default config: 1000 credits at the 1e6 micro-credit multiplier.
    assert_eq!(value["credits_balance"], 1_000_000_000i64);

    let response = app
        .clone()
        .oneshot(get(&format!("/v1/users/{user_id}/balance")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    assert_eq!(value["credits_balance"], 1_000_000_000i64);
    assert_eq!(value["has_purchased"], false);

    assert!(store.reconcile(user_id).await.expect("reconcile").balanced);
}

#[tokio::test]
async fn estimate_prices_a_request_without_touching_state() {
    let (_dir, app, store) = build_app(streaming(Vec::new())).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/credits/estimate",
            &json!({"model": "gpt-4o-mini", "text": "teh quick brwon fox"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    assert!(value["credits_estimate"].as_u64().expect("estimate") > 0);

    let response = app
        .oneshot(post_json(
            "/v1/credits/estimate",
            &json!({"model": "gpt-5", "text": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = json_body(response).await;
    assert_eq!(value["error"]["code"], "unknown_model");

    // Estimates never open usage rows.
    let user_id = seed_user(&store, 0).await;
    assert!(store.list_usage(user_id, 10).await.expect("usage").is_empty());
}

#[tokio::test]
async fn history_endpoints_return_transactions_and_usage() {
    let backend = streaming(vec![Step::Text("Fixed."), Step::Usage(1000, 500)]);
    let (_dir, app, store) = build_app(backend).await;
    let user_id = seed_user(&store, 1_000).await;

    let response = app
        .clone()
        .oneshot(post_json("/v1/optimize", &optimize_body(user_id)))
        .await
        .unwrap();
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let response = app
        .clone()
        .oneshot(get(&format!("/v1/users/{user_id}/transactions")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    let transactions = value["transactions"].as_array().expect("transactions");
    assert_eq!(transactions.len(), 2, "signup grant plus the usage debit");
    assert_eq!(transactions[0]["transaction_type"], "usage");
    assert_eq!(transactions[0]["amount"], -450);

    let response = app
        .clone()
        .oneshot(get(&format!("/v1/users/{user_id}/usage?limit=5")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    let usage = value["usage"].as_array().expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0]["status"], "completed");
    assert_eq!(usage[0]["credits_used"], 450);

    let response = app
        .oneshot(get("/v1/users/999/transactions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert!(store.reconcile(user_id).await.expect("reconcile").balanced);
}

#[tokio::test]
async fn reconciliation_endpoint_surfaces_uncollected_usage() {
    // Balance 10 passes the gate; the real cost of 450 cannot be settled.
    let backend = streaming(vec![Step::Text("Fixed."), Step::Usage(1000, 500)]);
    let (_dir, app, store) = build_app(backend).await;
    let user_id = seed_user(&store, 10).await;

    let response = app
        .clone()
        .oneshot(post_json("/v1/optimize", &optimize_body(user_id)))
        .await
        .unwrap();
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let response = app
        .oneshot(get(&format!("/v1/users/{user_id}/reconciliation")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let value = json_body(response).await;
    assert_eq!(value["balanced"], true);
    assert_eq!(
        value["uncollected_usage_ids"].as_array().expect("ids").len(),
        1
    );
    assert_eq!(store.balance(user_id).await.expect("balance"), 10);
}

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::config::CreditsConfig;
use crate::gate::GateError;
use crate::orchestrator::{OptimizeError, OptimizeRequest, Optimizer};
use crate::pricing::PricingError;
use crate::records::TransactionKind;
use crate::store::{LedgerError, LedgerStore};

#[derive(Clone)]
pub struct AppState {
    optimizer: Arc<Optimizer>,
    store: LedgerStore,
    credits: CreditsConfig,
}

impl AppState {
    pub fn new(optimizer: Arc<Optimizer>, credits: CreditsConfig) -> Self {
        let store = optimizer.store().clone();
        Self {
            optimizer,
            store,
            credits,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/optimize", post(handle_optimize))
        .route("/v1/users", post(handle_create_user))
        .route("/v1/users/:user_id/balance", get(handle_balance))
        .route("/v1/users/:user_id/transactions", get(handle_transactions))
        .route("/v1/users/:user_id/usage", get(handle_usage))
        .route(
            "/v1/users/:user_id/reconciliation",
            get(handle_reconciliation),
        )
        .route("/v1/credits/estimate", post(handle_estimate))
        .route("/v1/payments/webhook", post(handle_payment_webhook))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "code": self.code, "message": self.message }
        }));
        (self.status, body).into_response()
    }
}

fn api_error_from_optimize(err: OptimizeError) -> ApiError {
    match err {
        OptimizeError::Gate(gate) => api_error_from_gate(gate),
        OptimizeError::Registry(err) => {
            ApiError::new(StatusCode::BAD_REQUEST, "unknown_model", err.to_string())
        }
        OptimizeError::Pricing(err) => api_error_from_pricing(err),
        OptimizeError::Ledger(err) => api_error_from_ledger(err),
        OptimizeError::Provider(err) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "provider_error",
            err.to_string(),
        ),
    }
}

fn api_error_from_gate(err: GateError) -> ApiError {
    let status_code = match &err {
        GateError::TextTooLong { .. } => (StatusCode::BAD_REQUEST, "text_too_long"),
        GateError::PromptTooLong { .. } => (StatusCode::BAD_REQUEST, "prompt_too_long"),
        GateError::ContextTooLong { .. } => (StatusCode::BAD_REQUEST, "context_too_long"),
        GateError::InsufficientCredits { .. } => {
            (StatusCode::PAYMENT_REQUIRED, "insufficient_credits")
        }
        GateError::Ledger(ledger) => return api_error_from_ledger_ref(ledger, err.to_string()),
    };
    ApiError::new(status_code.0, status_code.1, err.to_string())
}

fn api_error_from_pricing(err: PricingError) -> ApiError {
    match &err {
        PricingError::UnknownModel { .. } => {
            ApiError::new(StatusCode::BAD_REQUEST, "unknown_model", err.to_string())
        }
        PricingError::InvalidRate { .. } => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "misconfigured_model",
            err.to_string(),
        ),
    }
}

fn api_error_from_ledger(err: LedgerError) -> ApiError {
    let message = err.to_string();
    api_error_from_ledger_ref(&err, message)
}

fn api_error_from_ledger_ref(err: &LedgerError, message: String) -> ApiError {
    match err {
        LedgerError::UnknownUser { .. } => {
            ApiError::new(StatusCode::NOT_FOUND, "unknown_user", message)
        }
        LedgerError::UnknownUsageLog { .. } => {
            ApiError::new(StatusCode::NOT_FOUND, "unknown_usage_log", message)
        }
        LedgerError::InsufficientCredits { .. } => {
            ApiError::new(StatusCode::PAYMENT_REQUIRED, "insufficient_credits", message)
        }
        _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", message),
    }
}

#[derive(Deserialize)]
struct OptimizeBody {
    user_id: i64,
    text: String,
    model: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    custom_prompt: Option<String>,
    #[serde(default)]
    context: Option<String>,
}

async fn handle_optimize(
    State(state): State<AppState>,
    Json(body): Json<OptimizeBody>,
) -> Result<Response, ApiError> {
    let request = OptimizeRequest {
        user_id: body.user_id,
        text: body.text,
        model: body.model,
        language: body.language,
        custom_prompt: body.custom_prompt,
        context: body.context,
    };

    let optimization = state
        .optimizer
        .optimize(request)
        .await
        .map_err(api_error_from_optimize)?;

    // Billing runs on the orchestrator's task whether or not this body is
    // consumed; the outcome channel is only for callers that want it.
    drop(optimization.outcome);
    let body = Body::from_stream(
        optimization
            .stream
            .map(Ok::<_, std::convert::Infallible>),
    );
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

#[derive(Deserialize)]
struct CreateUserBody {
    email: String,
}

async fn handle_create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserBody>,
) -> Result<Response, ApiError> {
    let email = body.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_email",
            "a valid email address is required",
        ));
    }

    let user = state
        .store
        .create_or_get_user(email, state.credits.starting_balance_micro())
        .await
        .map_err(api_error_from_ledger)?;
    Ok(Json(user).into_response())
}

async fn handle_balance(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Response, ApiError> {
    let balance = state
        .store
        .balance(user_id)
        .await
        .map_err(api_error_from_ledger)?;
    let has_purchased = state
        .store
        .has_purchases(user_id)
        .await
        .map_err(api_error_from_ledger)?;
    Ok(Json(json!({
        "credits_balance": balance,
        "has_purchased": has_purchased,
    }))
    .into_response())
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    50
}

async fn handle_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    // Listing an absent user is indistinguishable from an empty history in
    // the store; resolve the user first so the 404 is explicit.
    state.store.user(user_id).await.map_err(api_error_from_ledger)?;
    let transactions = state
        .store
        .list_transactions(user_id, query.limit)
        .await
        .map_err(api_error_from_ledger)?;
    Ok(Json(json!({ "transactions": transactions })).into_response())
}

async fn handle_usage(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    state.store.user(user_id).await.map_err(api_error_from_ledger)?;
    let usage = state
        .store
        .list_usage(user_id, query.limit)
        .await
        .map_err(api_error_from_ledger)?;
    Ok(Json(json!({ "usage": usage })).into_response())
}

async fn handle_reconciliation(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Response, ApiError> {
    let report = state
        .store
        .reconcile(user_id)
        .await
        .map_err(api_error_from_ledger)?;
    Ok(Json(report).into_response())
}

#[derive(Deserialize)]
struct EstimateBody {
    model: String,
    text: String,
    #[serde(default)]
    custom_prompt: Option<String>,
    #[serde(default)]
    context: Option<String>,
}

async fn handle_estimate(
    State(state): State<AppState>,
    Json(body): Json<EstimateBody>,
) -> Result<Response, ApiError> {
    let estimate = state
        .optimizer
        .estimate(
            &body.model,
            &body.text,
            body.custom_prompt.as_deref(),
            body.context.as_deref(),
        )
        .map_err(api_error_from_pricing)?;
    Ok(Json(json!({ "credits_estimate": estimate })).into_response())
}

#[derive(Deserialize)]
struct PaymentWebhookBody {
    user_id: i64,
    /// Purchased amount in micro-credits.
    credits: u64,
    /// Payment-provider session or intent id; replays are no-ops.
    reference_id: String,
}

async fn handle_payment_webhook(
    State(state): State<AppState>,
    Json(body): Json<PaymentWebhookBody>,
) -> Result<Response, ApiError> {
    if body.reference_id.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_reference",
            "reference_id is required",
        ));
    }

    let balance = state
        .store
        .credit(
            body.user_id,
            body.credits,
            body.reference_id.trim(),
            TransactionKind::Purchase,
            Some("payment provider"),
        )
        .await
        .map_err(api_error_from_ledger)?;
    Ok(Json(json!({
        "received": true,
        "credits_balance": balance,
    }))
    .into_response())
}

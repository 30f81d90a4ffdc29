use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::RequestLimits;
use crate::gate::{self, GateError};
use crate::pricing::{PricingError, RateTable};
use crate::provider::{GenerationRequest, GenerationStream, ProviderError, TokenUsage};
use crate::records::UsageStatus;
use crate::registry::{ModelRegistry, RegistryError};
use crate::store::{LedgerError, LedgerStore};
use crate::tokens;

pub const REQUEST_TYPE_OPTIMIZATION: &str = "optimization";

#[derive(Clone, Debug)]
pub struct OptimizeRequest {
    pub user_id: i64,
    pub text: String,
    pub model: String,
    pub language: Option<String>,
    pub custom_prompt: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// What finally happened to one optimize request, delivered after the
/// stream ends and billing is done. Dropping the receiver is fine; billing
/// does not depend on anyone listening.
#[derive(Clone, Debug)]
pub struct OptimizeOutcome {
    pub usage_log_id: i64,
    pub status: UsageStatus,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Computed cost in micro-credits (zero on failure).
    pub credits_used: u64,
    /// Whether the cost was actually debited. False when settlement lost
    /// the balance race after a successful generation.
    pub collected: bool,
    pub new_balance: Option<i64>,
    pub response_time_ms: u64,
}

/// Text chunks of an in-flight generation.
#[derive(Debug)]
pub struct OptimizeStream {
    rx: mpsc::Receiver<Bytes>,
}

impl Stream for OptimizeStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug)]
pub struct Optimization {
    pub stream: OptimizeStream,
    pub outcome: oneshot::Receiver<OptimizeOutcome>,
}

/// Sequences one paid optimization: gate, usage-log open, backend stream,
/// settlement, usage-log close. The only component allowed to call
/// [`LedgerStore::settle`] for usage, and it does so at most once per
/// usage row, only on the success path.
pub struct Optimizer {
    store: LedgerStore,
    rates: Arc<RateTable>,
    registry: Arc<ModelRegistry>,
    limits: RequestLimits,
}

impl Optimizer {
    pub fn new(
        store: LedgerStore,
        rates: Arc<RateTable>,
        registry: Arc<ModelRegistry>,
        limits: RequestLimits,
    ) -> Self {
        Self {
            store,
            rates,
            registry,
            limits,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Pre-flight cost estimate for a request, in micro-credits.
    pub fn estimate(
        &self,
        model: &str,
        text: &str,
        custom_prompt: Option<&str>,
        context: Option<&str>,
    ) -> Result<u64, PricingError> {
        let input_tokens = tokens::estimate_request_tokens(model, text, custom_prompt, context);
        let output_tokens = tokens::estimate_output_tokens(model, text);
        self.rates.cost_micro_credits(model, input_tokens, output_tokens)
    }

    /// Starts one optimization and returns its chunk stream.
    ///
    /// Failures before the usage row opens (gate, unknown model) cost
    /// nothing and leave no state. Once the backend stream is obtained the
    /// rest of the sequence runs on a detached task: a client that
    /// disconnects mid-stream only drops the chunk receiver, while
    /// generation, settlement, and the log close run to completion.
    pub async fn optimize(&self, request: OptimizeRequest) -> Result<Optimization, OptimizeError> {
        gate::check_request(
            &self.store,
            &self.limits,
            request.user_id,
            &request.text,
            request.custom_prompt.as_deref(),
            request.context.as_deref(),
        )
        .await?;

        let backend = self.registry.resolve(&request.model)?;
        let input_estimate = tokens::estimate_request_tokens(
            &request.model,
            &request.text,
            request.custom_prompt.as_deref(),
            request.context.as_deref(),
        );
        let output_estimate = tokens::estimate_output_tokens(&request.model, &request.text);
        let estimated_credits =
            self.rates
                .cost_micro_credits(&request.model, input_estimate, output_estimate)?;

        let usage_log_id = self
            .store
            .open_usage(
                request.user_id,
                REQUEST_TYPE_OPTIMIZATION,
                &request.model,
                input_estimate,
                estimated_credits,
            )
            .await?;

        let started = Instant::now();
        let generation = GenerationRequest {
            model: request.model.clone(),
            text: request.text.clone(),
            language: request.language.clone(),
            custom_prompt: request.custom_prompt.clone(),
            context: request.context.clone(),
        };
        let stream = match backend.stream(generation).await {
            Ok(stream) => stream,
            Err(err) => {
                let elapsed_ms = elapsed_millis(started);
                if let Err(close_err) = self
                    .store
                    .close_usage(
                        usage_log_id,
                        input_estimate,
                        0,
                        UsageStatus::Failed,
                        elapsed_ms,
                        Some(0),
                        Some(&err.to_string()),
                    )
                    .await
                {
                    tracing::error!(usage_log_id, error = %close_err, "failed to close usage log");
                }
                return Err(err.into());
            }
        };

        let (chunk_tx, chunk_rx) = mpsc::channel(16);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(drive_generation(GenerationTask {
            store: self.store.clone(),
            rates: Arc::clone(&self.rates),
            model: request.model,
            user_id: request.user_id,
            usage_log_id,
            input_estimate,
            stream,
            chunk_tx,
            outcome_tx,
            started,
        }));

        Ok(Optimization {
            stream: OptimizeStream { rx: chunk_rx },
            outcome: outcome_rx,
        })
    }
}

struct GenerationTask {
    store: LedgerStore,
    rates: Arc<RateTable>,
    model: String,
    user_id: i64,
    usage_log_id: i64,
    input_estimate: u32,
    stream: GenerationStream,
    chunk_tx: mpsc::Sender<Bytes>,
    outcome_tx: oneshot::Sender<OptimizeOutcome>,
    started: Instant,
}

async fn drive_generation(task: GenerationTask) {
    let GenerationTask {
        store,
        rates,
        model,
        user_id,
        usage_log_id,
        input_estimate,
        mut stream,
        chunk_tx,
        outcome_tx,
        started,
    } = task;

    let mut full_text = String::new();
    let mut usage: Option<TokenUsage> = None;
    let mut failure: Option<ProviderError> = None;

    while let Some(next) = stream.next().await {
        match next {
            Ok(chunk) => {
                if let Some(chunk_usage) = chunk.usage {
                    usage = Some(chunk_usage);
                }
                if !chunk.text.is_empty() {
                    full_text.push_str(&chunk.text);
                    // A closed receiver means the client disconnected; the
                    // generation is still consumed so it settles and logs.
                    let _ = chunk_tx.send(Bytes::from(chunk.text.into_bytes())).await;
                }
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    let response_time_ms = elapsed_millis(started);
    let input_tokens = usage
        .and_then(|usage| usage.input_tokens)
        .unwrap_or(input_estimate);

    let outcome = if let Some(err) = failure {
        let output_tokens = usage.and_then(|usage| usage.output_tokens).unwrap_or(0);
        close_usage_logged(
            &store,
            usage_log_id,
            input_tokens,
            output_tokens,
            UsageStatus::Failed,
            response_time_ms,
            Some(0),
            Some(&err.to_string()),
        )
        .await;
        OptimizeOutcome {
            usage_log_id,
            status: UsageStatus::Failed,
            input_tokens,
            output_tokens,
            credits_used: 0,
            collected: false,
            new_balance: None,
            response_time_ms,
        }
    } else {
        let output_tokens = usage
            .and_then(|usage| usage.output_tokens)
            .unwrap_or_else(|| tokens::estimate_tokens(&model, &full_text));
        settle_and_close(
            &store,
            &rates,
            &model,
            user_id,
            usage_log_id,
            input_tokens,
            output_tokens,
            response_time_ms,
        )
        .await
    };

    let _ = outcome_tx.send(outcome);
}

#[allow(clippy::too_many_arguments)]
async fn settle_and_close(
    store: &LedgerStore,
    rates: &RateTable,
    model: &str,
    user_id: i64,
    usage_log_id: i64,
    input_tokens: u32,
    output_tokens: u32,
    response_time_ms: u64,
) -> OptimizeOutcome {
    let credits_used = match rates.cost_micro_credits(model, input_tokens, output_tokens) {
        Ok(credits) => credits,
        Err(err) => {
            // The model was validated at startup; reaching this means the
            // rate table changed under a live request.
            tracing::error!(usage_log_id, model, error = %err, "cost computation failed");
            close_usage_logged(
                store,
                usage_log_id,
                input_tokens,
                output_tokens,
                UsageStatus::Completed,
                response_time_ms,
                Some(0),
                Some(&format!("cost computation failed: {err}")),
            )
            .await;
            return OptimizeOutcome {
                usage_log_id,
                status: UsageStatus::Completed,
                input_tokens,
                output_tokens,
                credits_used: 0,
                collected: false,
                new_balance: None,
                response_time_ms,
            };
        }
    };

    let (collected, new_balance, discrepancy) =
        match store.settle(user_id, credits_used, usage_log_id).await {
            Ok(balance) => (true, Some(balance), None),
            Err(LedgerError::InsufficientCredits { balance, attempted }) => {
                tracing::warn!(
                    user_id,
                    usage_log_id,
                    balance,
                    attempted,
                    "settlement lost the balance race; cost not collected"
                );
                (
                    false,
                    None,
                    Some("settlement failed: insufficient credits".to_string()),
                )
            }
            Err(err) => {
                tracing::error!(user_id, usage_log_id, error = %err, "settlement failed");
                (false, None, Some(format!("settlement error: {err}")))
            }
        };

    close_usage_logged(
        store,
        usage_log_id,
        input_tokens,
        output_tokens,
        UsageStatus::Completed,
        response_time_ms,
        Some(credits_used),
        discrepancy.as_deref(),
    )
    .await;

    OptimizeOutcome {
        usage_log_id,
        status: UsageStatus::Completed,
        input_tokens,
        output_tokens,
        credits_used,
        collected,
        new_balance,
        response_time_ms,
    }
}

#[allow(clippy::too_many_arguments)]
async fn close_usage_logged(
    store: &LedgerStore,
    usage_log_id: i64,
    input_tokens: u32,
    output_tokens: u32,
    status: UsageStatus,
    response_time_ms: u64,
    credits_used: Option<u64>,
    error_message: Option<&str>,
) {
    if let Err(err) = store
        .close_usage(
            usage_log_id,
            input_tokens,
            output_tokens,
            status,
            response_time_ms,
            credits_used,
            error_message,
        )
        .await
    {
        tracing::error!(usage_log_id, error = %err, "failed to close usage log");
    }
}

fn elapsed_millis(started: Instant) -> u64 {
    let millis = started.elapsed().as_millis();
    if millis > u128::from(u64::MAX) {
        u64::MAX
    } else {
        millis as u64
    }
}

use thiserror::Error;

use crate::config::RequestLimits;
use crate::store::{LedgerError, LedgerStore};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("text too long: {length} chars (limit {limit})")]
    TextTooLong { length: usize, limit: usize },
    #[error("custom prompt too long: {length} chars (limit {limit})")]
    PromptTooLong { length: usize, limit: usize },
    #[error("context too long: {length} chars (limit {limit})")]
    ContextTooLong { length: usize, limit: usize },
    #[error("insufficient credits: balance={balance}")]
    InsufficientCredits { balance: i64 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Best-effort pre-check before a paid operation starts: the input fits the
/// configured size limits and the balance is positive.
///
/// Read-only; nothing is reserved. The balance can change between this check
/// and settlement, so settlement's conditional decrement stays the
/// authoritative gate; this one only avoids wasted provider calls.
pub async fn check_request(
    store: &LedgerStore,
    limits: &RequestLimits,
    user_id: i64,
    text: &str,
    custom_prompt: Option<&str>,
    context: Option<&str>,
) -> Result<(), GateError> {
    let length = text.chars().count();
    if length > limits.max_text_chars {
        return Err(GateError::TextTooLong {
            length,
            limit: limits.max_text_chars,
        });
    }

    if let Some(prompt) = custom_prompt {
        let length = prompt.chars().count();
        if length > limits.max_prompt_chars {
            return Err(GateError::PromptTooLong {
                length,
                limit: limits.max_prompt_chars,
            });
        }
    }

    if let Some(context) = context {
        let length = context.chars().count();
        if length > limits.max_context_chars {
            return Err(GateError::ContextTooLong {
                length,
                limit: limits.max_context_chars,
            });
        }
    }

    let balance = store.balance(user_id).await?;
    if balance <= 0 {
        return Err(GateError::InsufficientCredits { balance });
    }
    Ok(())
}

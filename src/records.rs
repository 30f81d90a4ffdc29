use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    /// Cached aggregate of the user's transactions, in micro-credits.
    pub credits_balance: i64,
    pub created_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Usage,
    Purchase,
    PurchaseCredits,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Usage => "usage",
            TransactionKind::Purchase => "purchase",
            TransactionKind::PurchaseCredits => "purchase_credits",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "usage" => Some(TransactionKind::Usage),
            "purchase" => Some(TransactionKind::Purchase),
            "purchase_credits" => Some(TransactionKind::PurchaseCredits),
            _ => None,
        }
    }

    pub fn is_purchase(self) -> bool {
        matches!(
            self,
            TransactionKind::Purchase | TransactionKind::PurchaseCredits
        )
    }
}

/// Immutable append-only ledger entry. `amount` is signed: negative for
/// usage debits, positive for purchases and grants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    #[serde(rename = "transaction_type")]
    pub kind: TransactionKind,
    pub reference_id: Option<String>,
    pub notes: Option<String>,
    pub created_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Processing,
    Completed,
    Failed,
}

impl UsageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageStatus::Processing => "processing",
            UsageStatus::Completed => "completed",
            UsageStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processing" => Some(UsageStatus::Processing),
            "completed" => Some(UsageStatus::Completed),
            "failed" => Some(UsageStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, UsageStatus::Processing)
    }
}

/// Audit record of one optimization attempt, independent of whether it was
/// billed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageLogRecord {
    pub id: i64,
    pub user_id: i64,
    pub request_type: String,
    pub model_type: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub credits_used: u64,
    pub status: UsageStatus,
    pub error_message: Option<String>,
    pub response_time_ms: Option<u64>,
    pub created_at_ms: u64,
}

/// Result of scanning one user's ledger for drift: the cached balance
/// against the transaction sum, plus completed usage rows whose cost was
/// never collected (no matching `usage` transaction).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub user_id: i64,
    pub credits_balance: i64,
    pub transaction_sum: i64,
    pub balanced: bool,
    pub uncollected_usage_ids: Vec<i64>,
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::records::{
    ReconciliationReport, TransactionKind, TransactionRecord, UsageLogRecord, UsageStatus,
    UserRecord,
};

/// SQLite-backed credits ledger and usage log.
///
/// Every call opens a connection on a blocking thread; the balance column is
/// the only hot shared mutable resource and all writes to it go through
/// IMMEDIATE transactions, so the read-check-write in [`settle`] is the sole
/// concurrency-safety mechanism the ledger needs.
///
/// [`settle`]: LedgerStore::settle
#[derive(Clone, Debug)]
pub struct LedgerStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown user: {user_id}")]
    UnknownUser { user_id: i64 },
    #[error("unknown usage log: {usage_log_id}")]
    UnknownUsageLog { usage_log_id: i64 },
    #[error("insufficient credits: balance={balance} attempted={attempted}")]
    InsufficientCredits { balance: i64, attempted: u64 },
    #[error("transaction kind {kind} cannot be credited")]
    InvalidCreditKind { kind: &'static str },
    #[error("usage log can only close to a terminal status")]
    NonTerminalClose,
    #[error("corrupted {table} row id={id}")]
    CorruptRow { table: &'static str, id: i64 },
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), LedgerError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Returns the existing account for `email` or creates one with the
    /// configured starting balance. The starting balance is recorded as a
    /// `purchase_credits` grant in the same transaction, so the
    /// reconciliation invariant holds from the first row.
    pub async fn create_or_get_user(
        &self,
        email: &str,
        starting_balance_micro: i64,
    ) -> Result<UserRecord, LedgerError> {
        let path = self.path.clone();
        let email = email.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<UserRecord, LedgerError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing = tx
                .query_row(
                    "SELECT id, email, credits_balance, created_at_ms FROM users WHERE email=?1",
                    rusqlite::params![email],
                    user_from_row,
                )
                .optional()?;
            if let Some(user) = existing {
                return Ok(user);
            }

            tx.execute(
                "INSERT INTO users (email, credits_balance, created_at_ms) VALUES (?1, ?2, ?3)",
                rusqlite::params![email, starting_balance_micro.max(0), ts_ms],
            )?;
            let user_id = tx.last_insert_rowid();

            if starting_balance_micro > 0 {
                tx.execute(
                    "INSERT INTO credits_transactions
                         (user_id, amount, transaction_type, reference_id, notes, created_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        user_id,
                        starting_balance_micro,
                        TransactionKind::PurchaseCredits.as_str(),
                        format!("signup:{email}"),
                        "starting balance",
                        ts_ms
                    ],
                )?;
            }

            tx.commit()?;
            Ok(UserRecord {
                id: user_id,
                email,
                credits_balance: starting_balance_micro.max(0),
                created_at_ms: i64_to_u64(ts_ms),
            })
        })
        .await?
    }

    pub async fn user(&self, user_id: i64) -> Result<UserRecord, LedgerError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<UserRecord, LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.query_row(
                "SELECT id, email, credits_balance, created_at_ms FROM users WHERE id=?1",
                rusqlite::params![user_id],
                user_from_row,
            )
            .optional()?
            .ok_or(LedgerError::UnknownUser { user_id })
        })
        .await?
    }

    pub async fn balance(&self, user_id: i64) -> Result<i64, LedgerError> {
        Ok(self.user(user_id).await?.credits_balance)
    }

    /// Atomically debits `amount_micro` from the user and appends the
    /// matching `usage` transaction referencing the usage-log row.
    ///
    /// The decrement is conditioned on `credits_balance >= amount`; this is
    /// the authoritative balance check. When two requests race past the
    /// gate's pre-check, the loser fails here with `InsufficientCredits`
    /// and nothing is committed.
    pub async fn settle(
        &self,
        user_id: i64,
        amount_micro: u64,
        usage_log_id: i64,
    ) -> Result<i64, LedgerError> {
        let path = self.path.clone();
        let amount_i64 = micro_to_i64(amount_micro);
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<i64, LedgerError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let changed = tx.execute(
                "UPDATE users
                 SET credits_balance = credits_balance - ?2
                 WHERE id = ?1 AND credits_balance >= ?2",
                rusqlite::params![user_id, amount_i64],
            )?;
            if changed == 0 {
                let balance: Option<i64> = tx
                    .query_row(
                        "SELECT credits_balance FROM users WHERE id=?1",
                        rusqlite::params![user_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match balance {
                    Some(balance) => LedgerError::InsufficientCredits {
                        balance,
                        attempted: amount_micro,
                    },
                    None => LedgerError::UnknownUser { user_id },
                });
            }

            tx.execute(
                "INSERT INTO credits_transactions
                     (user_id, amount, transaction_type, reference_id, notes, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user_id,
                    -amount_i64,
                    TransactionKind::Usage.as_str(),
                    usage_log_id.to_string(),
                    "text optimization",
                    ts_ms
                ],
            )?;

            let new_balance: i64 = tx.query_row(
                "SELECT credits_balance FROM users WHERE id=?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(new_balance)
        })
        .await?
    }

    /// Credits a purchase (or grant) and appends the transaction row.
    ///
    /// The payment provider delivers webhooks at-least-once, so a
    /// `reference_id` that already has a purchase-type transaction is a
    /// no-op success returning the current balance.
    pub async fn credit(
        &self,
        user_id: i64,
        amount_micro: u64,
        reference_id: &str,
        kind: TransactionKind,
        notes: Option<&str>,
    ) -> Result<i64, LedgerError> {
        if !kind.is_purchase() {
            return Err(LedgerError::InvalidCreditKind {
                kind: kind.as_str(),
            });
        }

        let path = self.path.clone();
        let reference_id = reference_id.to_string();
        let notes = notes.map(str::to_string);
        let amount_i64 = micro_to_i64(amount_micro);
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<i64, LedgerError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<i64> = tx
                .query_row(
                    "SELECT credits_balance FROM users WHERE id=?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Err(LedgerError::UnknownUser { user_id });
            };

            let replay: Option<i64> = tx
                .query_row(
                    "SELECT id FROM credits_transactions
                     WHERE reference_id = ?1
                       AND transaction_type IN ('purchase', 'purchase_credits')",
                    rusqlite::params![reference_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(transaction_id) = replay {
                tracing::warn!(
                    reference_id = %reference_id,
                    transaction_id,
                    "replayed purchase reference; crediting skipped"
                );
                return Ok(current);
            }

            tx.execute(
                "UPDATE users SET credits_balance = credits_balance + ?2 WHERE id = ?1",
                rusqlite::params![user_id, amount_i64],
            )?;
            tx.execute(
                "INSERT INTO credits_transactions
                     (user_id, amount, transaction_type, reference_id, notes, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    user_id,
                    amount_i64,
                    kind.as_str(),
                    reference_id,
                    notes,
                    ts_ms
                ],
            )?;

            let new_balance: i64 = tx.query_row(
                "SELECT credits_balance FROM users WHERE id=?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(new_balance)
        })
        .await?
    }

    /// Opens a `processing` usage row before the external call starts, so a
    /// crash mid-call still leaves an auditable record.
    pub async fn open_usage(
        &self,
        user_id: i64,
        request_type: &str,
        model_type: &str,
        input_tokens: u32,
        estimated_credits: u64,
    ) -> Result<i64, LedgerError> {
        let path = self.path.clone();
        let request_type = request_type.to_string();
        let model_type = model_type.to_string();
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<i64, LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_logs
                     (user_id, request_type, model_type, input_tokens, output_tokens,
                      credits_used, status, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
                rusqlite::params![
                    user_id,
                    request_type,
                    model_type,
                    input_tokens,
                    micro_to_i64(estimated_credits),
                    UsageStatus::Processing.as_str(),
                    ts_ms
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }

    /// Transitions a usage row to a terminal status with the final token
    /// counts and elapsed time. `credits_used` of `None` keeps the value
    /// already on the row.
    ///
    /// The orchestrator calls this exactly once per row; a close against an
    /// already-terminal row is last-write-wins and logged, never silent.
    pub async fn close_usage(
        &self,
        usage_log_id: i64,
        input_tokens: u32,
        output_tokens: u32,
        status: UsageStatus,
        response_time_ms: u64,
        credits_used: Option<u64>,
        error_message: Option<&str>,
    ) -> Result<(), LedgerError> {
        if !status.is_terminal() {
            return Err(LedgerError::NonTerminalClose);
        }

        let path = self.path.clone();
        let error_message = error_message.map(str::to_string);
        let credits_i64 = credits_used.map(micro_to_i64);

        tokio::task::spawn_blocking(move || -> Result<(), LedgerError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let previous: Option<String> = tx
                .query_row(
                    "SELECT status FROM usage_logs WHERE id=?1",
                    rusqlite::params![usage_log_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(previous) = previous else {
                return Err(LedgerError::UnknownUsageLog { usage_log_id });
            };
            if UsageStatus::parse(&previous).is_some_and(UsageStatus::is_terminal) {
                tracing::warn!(
                    usage_log_id,
                    previous = %previous,
                    next = status.as_str(),
                    "usage log closed twice; last write wins"
                );
            }

            tx.execute(
                "UPDATE usage_logs
                 SET input_tokens = ?2,
                     output_tokens = ?3,
                     status = ?4,
                     response_time_ms = ?5,
                     credits_used = COALESCE(?6, credits_used),
                     error_message = ?7
                 WHERE id = ?1",
                rusqlite::params![
                    usage_log_id,
                    input_tokens,
                    output_tokens,
                    status.as_str(),
                    response_time_ms as i64,
                    credits_i64,
                    error_message
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn usage_log(&self, usage_log_id: i64) -> Result<UsageLogRecord, LedgerError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<UsageLogRecord, LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    "SELECT id, user_id, request_type, model_type, input_tokens, output_tokens,
                            credits_used, status, error_message, response_time_ms, created_at_ms
                     FROM usage_logs WHERE id=?1",
                    rusqlite::params![usage_log_id],
                    usage_raw_from_row,
                )
                .optional()?;
            match row {
                Some(raw) => usage_from_raw(raw),
                None => Err(LedgerError::UnknownUsageLog { usage_log_id }),
            }
        })
        .await?
    }

    pub async fn list_transactions(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let path = self.path.clone();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<TransactionRecord>, LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, amount, transaction_type, reference_id, notes, created_at_ms
                 FROM credits_transactions
                 WHERE user_id=?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, user_id, amount, kind, reference_id, notes, created_at_ms) = row?;
                let kind = TransactionKind::parse(&kind).ok_or(LedgerError::CorruptRow {
                    table: "credits_transactions",
                    id,
                })?;
                out.push(TransactionRecord {
                    id,
                    user_id,
                    amount,
                    kind,
                    reference_id,
                    notes,
                    created_at_ms: i64_to_u64(created_at_ms),
                });
            }
            Ok(out)
        })
        .await?
    }

    pub async fn list_usage(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<UsageLogRecord>, LedgerError> {
        let path = self.path.clone();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageLogRecord>, LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, request_type, model_type, input_tokens, output_tokens,
                        credits_used, status, error_message, response_time_ms, created_at_ms
                 FROM usage_logs
                 WHERE user_id=?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], usage_raw_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(usage_from_raw(row?)?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn has_purchases(&self, user_id: i64) -> Result<bool, LedgerError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<bool, LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM credits_transactions
                 WHERE user_id=?1 AND transaction_type='purchase'",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await?
    }

    /// Scans one user's ledger for drift: the cached balance against the
    /// transaction sum, and completed usage rows whose cost was never
    /// collected. A crash between settlement and log-close, or a settle
    /// that lost the balance race, shows up here.
    pub async fn reconcile(&self, user_id: i64) -> Result<ReconciliationReport, LedgerError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<ReconciliationReport, LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let balance: Option<i64> = conn
                .query_row(
                    "SELECT credits_balance FROM users WHERE id=?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(credits_balance) = balance else {
                return Err(LedgerError::UnknownUser { user_id });
            };

            let transaction_sum: i64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM credits_transactions WHERE user_id=?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT ul.id FROM usage_logs ul
                 WHERE ul.user_id = ?1
                   AND ul.status = 'completed'
                   AND ul.credits_used > 0
                   AND NOT EXISTS (
                       SELECT 1 FROM credits_transactions ct
                       WHERE ct.user_id = ul.user_id
                         AND ct.transaction_type = 'usage'
                         AND ct.reference_id = CAST(ul.id AS TEXT)
                   )
                 ORDER BY ul.id",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id], |row| row.get::<_, i64>(0))?;
            let mut uncollected_usage_ids = Vec::new();
            for row in rows {
                uncollected_usage_ids.push(row?);
            }

            Ok(ReconciliationReport {
                user_id,
                credits_balance,
                transaction_sum,
                balanced: credits_balance == transaction_sum,
                uncollected_usage_ids,
            })
        })
        .await?
    }
}

type UsageRaw = (
    i64,
    i64,
    String,
    String,
    u32,
    u32,
    i64,
    String,
    Option<String>,
    Option<i64>,
    i64,
);

fn usage_raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRaw> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn usage_from_raw(raw: UsageRaw) -> Result<UsageLogRecord, LedgerError> {
    let (
        id,
        user_id,
        request_type,
        model_type,
        input_tokens,
        output_tokens,
        credits_used,
        status,
        error_message,
        response_time_ms,
        created_at_ms,
    ) = raw;
    let status = UsageStatus::parse(&status).ok_or(LedgerError::CorruptRow {
        table: "usage_logs",
        id,
    })?;
    Ok(UsageLogRecord {
        id,
        user_id,
        request_type,
        model_type,
        input_tokens,
        output_tokens,
        credits_used: i64_to_u64(credits_used),
        status,
        error_message,
        response_time_ms: response_time_ms.map(i64_to_u64),
        created_at_ms: i64_to_u64(created_at_ms),
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        credits_balance: row.get(2)?,
        created_at_ms: i64_to_u64(row.get(3)?),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            credits_balance INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credits_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            transaction_type TEXT NOT NULL,
            reference_id TEXT,
            notes TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credits_transactions_user_id
            ON credits_transactions(user_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_credits_transactions_purchase_ref
            ON credits_transactions(reference_id)
            WHERE transaction_type IN ('purchase', 'purchase_credits');

        CREATE TABLE IF NOT EXISTS usage_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            request_type TEXT NOT NULL,
            model_type TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            credits_used INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            error_message TEXT,
            response_time_ms INTEGER,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_logs_user_id
            ON usage_logs(user_id);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn micro_to_i64(micro: u64) -> i64 {
    if micro > i64::MAX as u64 {
        i64::MAX
    } else {
        micro as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

//! Idempotency ledger: the single source of truth for whether a
//! `(module, message_key)` has already run, is running now, or failed for
//! good.
//!
//! [`SqliteLedger::acquire`] is a single `INSERT .. ON CONFLICT DO UPDATE ..
//! WHERE .. RETURNING` statement. SQLite serializes writers, so when several
//! workers race on the same key exactly one statement creates or takes over
//! the row and gets it back; every other caller sees no returned row and
//! reads the winner's state instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::module::ModuleKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerStatus {
    Processing,
    Succeeded,
    FailedRetryable,
    FailedNonRetryable,
    StaleSkipped,
}

impl LedgerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedNonRetryable => "failed_nonretryable",
            Self::StaleSkipped => "stale_skipped",
        }
    }

    /// No further acquisition is ever granted for a terminal key.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedNonRetryable)
    }
}

impl Display for LedgerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "succeeded" => Ok(Self::Succeeded),
            "failed_retryable" => Ok(Self::FailedRetryable),
            "failed_nonretryable" => Ok(Self::FailedNonRetryable),
            "stale_skipped" => Ok(Self::StaleSkipped),
            other => Err(LedgerError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub module: ModuleKind,
    pub message_key: String,
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.module, self.message_key)
    }
}

#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub key: IdempotencyKey,
    pub user_id: String,
    pub payload_hash: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireOutcome {
    pub acquired: bool,
    pub status: LedgerStatus,
    pub attempt_count: u32,
}

/// Identifies the attempt a worker holds after a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerContext {
    pub key: IdempotencyKey,
    pub user_id: String,
    pub attempt_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub key: IdempotencyKey,
    pub user_id: String,
    pub status: LedgerStatus,
    pub attempt_count: u32,
    pub payload_hash: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub error: Option<String>,
    pub heartbeat_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProcessingLedger: Send + Sync {
    async fn acquire(&self, request: &AcquireRequest) -> Result<AcquireOutcome, LedgerError>;

    /// Refreshes liveness on a `processing` entry. Only the heartbeat
    /// timestamp is written, so racing a takeover never changes state.
    async fn heartbeat_processing(&self, context: &LedgerContext) -> Result<(), LedgerError>;

    async fn mark_succeeded(&self, context: &LedgerContext) -> Result<(), LedgerError>;

    async fn mark_retryable_failed(
        &self,
        context: &LedgerContext,
        error: &str,
    ) -> Result<(), LedgerError>;

    async fn mark_non_retryable_failed(
        &self,
        context: &LedgerContext,
        error: &str,
    ) -> Result<(), LedgerError>;

    async fn mark_stale_skipped(
        &self,
        context: &LedgerContext,
        error: &str,
    ) -> Result<(), LedgerError>;

    /// Sizes both the staleness check and queue visibility extensions.
    fn processing_stale(&self) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    pub processing_stale: Duration,
    /// How long a `failed_retryable` entry waits before it can be
    /// re-acquired.
    pub retry_delay: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            processing_stale: Duration::from_secs(120),
            retry_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
    config: LedgerConfig,
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    status: String,
    attempt_count: i64,
    payload_hash: String,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    module: String,
    message_key: String,
    user_id: String,
    status: String,
    attempt_count: i64,
    payload_hash: String,
    generated_at: String,
    expires_at: String,
    error: Option<String>,
    heartbeat_at_ms: i64,
    updated_at_ms: i64,
}

const ACQUIRE_SQL: &str = r#"
    INSERT INTO processing_ledger (
        module, message_key, user_id, status, attempt_count, payload_hash,
        generated_at, expires_at, error, heartbeat_at_ms, updated_at_ms
    )
    VALUES (?1, ?2, ?3, 'processing', 1, ?4, ?5, ?6, NULL, ?7, ?7)
    ON CONFLICT (module, message_key) DO UPDATE SET
        status = 'processing',
        attempt_count = processing_ledger.attempt_count + 1,
        user_id = excluded.user_id,
        generated_at = excluded.generated_at,
        expires_at = excluded.expires_at,
        heartbeat_at_ms = excluded.heartbeat_at_ms,
        updated_at_ms = excluded.updated_at_ms
    WHERE (processing_ledger.status = 'processing' AND processing_ledger.heartbeat_at_ms < ?8)
       OR (processing_ledger.status = 'failed_retryable' AND processing_ledger.updated_at_ms <= ?9)
    RETURNING status, attempt_count, payload_hash
"#;

impl SqliteLedger {
    pub fn new(pool: SqlitePool, config: LedgerConfig) -> Self {
        Self { pool, config }
    }

    pub async fn get_entry(
        &self,
        module: ModuleKind,
        message_key: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let row: Option<EntryRow> = sqlx::query_as(
            r#"
            SELECT module, message_key, user_id, status, attempt_count, payload_hash,
                   generated_at, expires_at, error, heartbeat_at_ms, updated_at_ms
            FROM processing_ledger
            WHERE module = ?1 AND message_key = ?2
            "#,
        )
        .bind(module.as_str())
        .bind(message_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(LedgerEntry::try_from).transpose()
    }

    pub async fn count_by_status(&self, status: LedgerStatus) -> Result<i64, LedgerError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processing_ledger WHERE status = ?1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn current_status(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<(LedgerStatus, u32, String)>, LedgerError> {
        let row: Option<AttemptRow> = sqlx::query_as(
            r#"
            SELECT status, attempt_count, payload_hash
            FROM processing_ledger
            WHERE module = ?1 AND message_key = ?2
            "#,
        )
        .bind(key.module.as_str())
        .bind(&key.message_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok((
                row.status.parse()?,
                u32::try_from(row.attempt_count)?,
                row.payload_hash,
            ))
        })
        .transpose()
    }

    #[tracing::instrument(
        skip(self, context, error),
        fields(key = %context.key, attempt_count = context.attempt_count),
        level = tracing::Level::DEBUG
    )]
    async fn transition(
        &self,
        context: &LedgerContext,
        status: LedgerStatus,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE processing_ledger
            SET status = ?1, error = COALESCE(?2, error), updated_at_ms = ?3
            WHERE module = ?4
              AND message_key = ?5
              AND attempt_count = ?6
              AND status NOT IN ('succeeded', 'failed_nonretryable')
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now_ms())
        .bind(context.key.module.as_str())
        .bind(&context.key.message_key)
        .bind(i64::from(context.attempt_count))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(key = %context.key, %status, "Ledger entry updated");
            return Ok(());
        }

        match self.current_status(&context.key).await? {
            None => Err(LedgerError::EntryNotFound {
                module: context.key.module,
                message_key: context.key.message_key.clone(),
            }),
            Some((current, current_attempt, _)) if current_attempt != context.attempt_count => {
                warn!(
                    key = %context.key,
                    %current,
                    current_attempt,
                    attempt_count = context.attempt_count,
                    requested = %status,
                    "Ledger update from superseded attempt ignored"
                );
                Ok(())
            }
            Some((current, _, _)) if current == status => {
                debug!(key = %context.key, %status, "Ledger entry already in requested state");
                Ok(())
            }
            Some((current, _, _)) => {
                warn!(
                    key = %context.key,
                    %current,
                    requested = %status,
                    "Terminal ledger entry left unchanged"
                );
                Ok(())
            }
        }
    }
}

fn warn_on_payload_drift(key: &IdempotencyKey, recorded: &str, delivered: &str) {
    if recorded != delivered {
        warn!(
            %key,
            recorded_hash = recorded,
            delivered_hash = delivered,
            "Payload drift: redelivered message differs from the first delivery"
        );
    }
}

#[async_trait]
impl ProcessingLedger for SqliteLedger {
    #[tracing::instrument(skip(self, request), fields(key = %request.key), level = tracing::Level::DEBUG)]
    async fn acquire(&self, request: &AcquireRequest) -> Result<AcquireOutcome, LedgerError> {
        let now = now_ms();
        let stale_cutoff = now.saturating_sub(duration_ms(self.config.processing_stale));
        let retry_cutoff = now.saturating_sub(duration_ms(self.config.retry_delay));

        let acquired: Option<AttemptRow> = sqlx::query_as(ACQUIRE_SQL)
            .bind(request.key.module.as_str())
            .bind(&request.key.message_key)
            .bind(&request.user_id)
            .bind(&request.payload_hash)
            .bind(request.generated_at.to_rfc3339())
            .bind(request.expires_at.to_rfc3339())
            .bind(now)
            .bind(stale_cutoff)
            .bind(retry_cutoff)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = acquired {
            let attempt_count = u32::try_from(row.attempt_count)?;
            warn_on_payload_drift(&request.key, &row.payload_hash, &request.payload_hash);
            info!(key = %request.key, attempt_count, "Acquired ledger entry");

            return Ok(AcquireOutcome {
                acquired: true,
                status: row.status.parse()?,
                attempt_count,
            });
        }

        let (status, attempt_count, recorded_hash) = self
            .current_status(&request.key)
            .await?
            .ok_or_else(|| LedgerError::EntryNotFound {
                module: request.key.module,
                message_key: request.key.message_key.clone(),
            })?;

        warn_on_payload_drift(&request.key, &recorded_hash, &request.payload_hash);
        info!(
            key = %request.key,
            %status,
            attempt_count,
            "Ledger entry not acquired"
        );

        Ok(AcquireOutcome {
            acquired: false,
            status,
            attempt_count,
        })
    }

    async fn heartbeat_processing(&self, context: &LedgerContext) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE processing_ledger
            SET heartbeat_at_ms = ?1
            WHERE module = ?2
              AND message_key = ?3
              AND attempt_count = ?4
              AND status = 'processing'
            "#,
        )
        .bind(now_ms())
        .bind(context.key.module.as_str())
        .bind(&context.key.message_key)
        .bind(i64::from(context.attempt_count))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                key = %context.key,
                attempt_count = context.attempt_count,
                "Heartbeat from superseded attempt or finished entry"
            );
        }

        Ok(())
    }

    async fn mark_succeeded(&self, context: &LedgerContext) -> Result<(), LedgerError> {
        self.transition(context, LedgerStatus::Succeeded, None).await
    }

    async fn mark_retryable_failed(
        &self,
        context: &LedgerContext,
        error: &str,
    ) -> Result<(), LedgerError> {
        self.transition(context, LedgerStatus::FailedRetryable, Some(error))
            .await
    }

    async fn mark_non_retryable_failed(
        &self,
        context: &LedgerContext,
        error: &str,
    ) -> Result<(), LedgerError> {
        self.transition(context, LedgerStatus::FailedNonRetryable, Some(error))
            .await
    }

    async fn mark_stale_skipped(
        &self,
        context: &LedgerContext,
        error: &str,
    ) -> Result<(), LedgerError> {
        self.transition(context, LedgerStatus::StaleSkipped, Some(error))
            .await
    }

    fn processing_stale(&self) -> Duration {
        self.config.processing_stale
    }
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let module = row
            .module
            .parse()
            .map_err(|_| LedgerError::InvalidModule(row.module.clone()))?;

        Ok(Self {
            key: IdempotencyKey {
                module,
                message_key: row.message_key,
            },
            user_id: row.user_id,
            status: row.status.parse()?,
            attempt_count: u32::try_from(row.attempt_count)?,
            payload_hash: row.payload_hash,
            generated_at: parse_rfc3339(&row.generated_at)?,
            expires_at: parse_rfc3339(&row.expires_at)?,
            error: row.error,
            heartbeat_at: from_millis(row.heartbeat_at_ms)?,
            updated_at: from_millis(row.updated_at_ms)?,
        })
    }
}

/// SHA-256 over a canonical rendering of `value` with object keys sorted,
/// hex encoded. Only used for audit; acquisition never looks at it.
pub fn hash_payload(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(left, _), (right, _)| left.cmp(right));

            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|_| LedgerError::InvalidTimestamp(raw.to_string()))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| LedgerError::InvalidTimestamp(millis.to_string()))
}

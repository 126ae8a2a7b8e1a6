//! Shared helpers for the worker pipeline tests: a file-backed database, a
//! counting executor, and a processor wired the way `launch` wires it.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use st0x_decisions::config::configure_sqlite_pool;
use st0x_decisions::envelope::{Envelope, EnvelopeRules};
use st0x_decisions::executor::{DecisionExecutor, ExecutionError, default_non_retryable};
use st0x_decisions::hooks::TracingHooks;
use st0x_decisions::inference::{AllocationInference, AllocationItemParser};
use st0x_decisions::ledger::{LedgerConfig, SqliteLedger};
use st0x_decisions::lock::{LockHandle, SqliteUserLocks};
use st0x_decisions::module::{ModuleAliases, ModuleKind};
use st0x_decisions::processor::{Collaborators, MessageProcessor, ProcessorConfig};
use st0x_decisions::queue::SqliteQueue;
use st0x_decisions::worker::WorkerSettings;

pub const PROCESSING_STALE: Duration = Duration::from_secs(120);

pub type Processor = MessageProcessor<AllocationItemParser, CountingExecutor>;

/// Keeps the temp directory alive for as long as the pool is in use.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

pub async fn file_db() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("decisions.db").display());

    let pool = configure_sqlite_pool(&url).await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();

    TestDb { pool, _dir: dir }
}

pub fn settings(concurrency: usize) -> WorkerSettings {
    WorkerSettings {
        batch_size: 10,
        concurrency,
        poll_interval: Duration::from_millis(10),
        visibility_timeout: PROCESSING_STALE,
    }
}

/// Counts executions and fails permanently or transiently when told to.
/// Clones share their counters.
#[derive(Clone, Default)]
pub struct CountingExecutor {
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
    transient_failures: Arc<AtomicUsize>,
    reject: bool,
}

impl CountingExecutor {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn failing_transiently(times: usize) -> Self {
        Self {
            transient_failures: Arc::new(AtomicUsize::new(times)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionExecutor for CountingExecutor {
    type Item = AllocationInference;
    type Error = ExecutionError;

    async fn execute_locked(
        &self,
        envelope: &Envelope<AllocationInference>,
        lock: &LockHandle,
    ) -> Result<(), ExecutionError> {
        lock.assert_held().await?;
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.reject {
            return Err(ExecutionError::Rejected {
                reason: format!("user {} paused trading", envelope.user_id),
            });
        }

        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if transient {
            return Err(ExecutionError::Failed("broker unavailable".to_string()));
        }

        Ok(())
    }
}

pub fn processor(
    pool: &SqlitePool,
    executor: CountingExecutor,
    heartbeat_interval: Duration,
) -> Processor {
    MessageProcessor::new(
        ProcessorConfig {
            rules: EnvelopeRules {
                expected_version: 1,
                module: ModuleKind::Allocation,
                aliases: ModuleAliases::legacy(),
            },
            heartbeat_interval,
        },
        AllocationItemParser,
        executor,
        default_non_retryable(),
        Collaborators {
            ledger: Arc::new(ledger(pool)),
            queue: Arc::new(SqliteQueue::new(pool.clone())),
            locks: Arc::new(SqliteUserLocks::new(pool.clone(), PROCESSING_STALE)),
            hooks: Arc::new(TracingHooks),
        },
    )
}

pub fn ledger(pool: &SqlitePool) -> SqliteLedger {
    SqliteLedger::new(
        pool.clone(),
        LedgerConfig {
            processing_stale: PROCESSING_STALE,
            retry_delay: Duration::ZERO,
        },
    )
}

pub fn envelope(module: &str, message_key: &str, user_id: &str) -> Value {
    let now = Utc::now();

    json!({
        "version": 1,
        "module": module,
        "runId": "run-7",
        "messageKey": message_key,
        "userId": user_id,
        "generatedAt": (now - ChronoDuration::minutes(1)).to_rfc3339(),
        "expiresAt": (now + ChronoDuration::minutes(30)).to_rfc3339(),
        "allocationMode": "rebalance",
        "inferences": [
            { "symbol": "msft", "category": "equity", "intensity": 0.8, "reason": "momentum" },
            { "symbol": "TLT", "category": "bond", "intensity": "0.2" }
        ]
    })
}

/// Makes every in-flight message visible again, as if its visibility
/// timeout had elapsed.
pub async fn expire_visibility(pool: &SqlitePool) {
    sqlx::query("UPDATE queue_messages SET visible_at_ms = 0")
        .execute(pool)
        .await
        .unwrap();
}

/// Moves every ledger heartbeat back past the stale window, as if the
/// claiming worker had died.
pub async fn age_claims(pool: &SqlitePool) {
    let stale_ms = i64::try_from(PROCESSING_STALE.as_millis()).unwrap() + 1_000;

    sqlx::query("UPDATE processing_ledger SET heartbeat_at_ms = heartbeat_at_ms - ?1")
        .bind(stale_ms)
        .execute(pool)
        .await
        .unwrap();
}

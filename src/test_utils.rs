//! Shared test fixtures: database setup, envelope builders, and recording
//! doubles for the queue, hooks and executor.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::envelope::{Envelope, MalformedMessage};
use crate::error::QueueError;
use crate::executor::{DecisionExecutor, ExecutionError};
use crate::heartbeat::HeartbeatError;
use crate::hooks::{ProcessingHooks, SkipReason};
use crate::inference::{AllocationInference, Symbol};
use crate::ledger::IdempotencyKey;
use crate::lock::LockHandle;
use crate::module::ModuleKind;
use crate::queue::{MessageQueue, QueueMessage, ReceiptHandle};

pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub(crate) fn queue_message(body: &str) -> QueueMessage {
    QueueMessage {
        message_id: Some("msg-1".to_string()),
        receipt_handle: ReceiptHandle("receipt-1".to_string()),
        body: body.to_string(),
        receive_count: 1,
    }
}

/// A valid version 1 envelope that expires half an hour from now.
pub(crate) fn envelope_json(module: &str, message_key: &str, user_id: &str) -> Value {
    let now = Utc::now();

    json!({
        "version": 1,
        "module": module,
        "runId": "run-1",
        "messageKey": message_key,
        "userId": user_id,
        "generatedAt": (now - ChronoDuration::minutes(1)).to_rfc3339(),
        "expiresAt": (now + ChronoDuration::minutes(30)).to_rfc3339(),
        "inferences": [
            { "symbol": "AAPL", "category": "equity", "intensity": "0.5" }
        ]
    })
}

pub(crate) fn sample_envelope(message_key: &str, user_id: &str) -> Envelope<AllocationInference> {
    let now = Utc::now();

    Envelope {
        version: 1,
        module: ModuleKind::Allocation,
        module_key: ModuleKind::Allocation,
        run_id: "run-1".to_string(),
        message_key: message_key.to_string(),
        user_id: user_id.to_string(),
        generated_at: now - ChronoDuration::minutes(1),
        expires_at: now + ChronoDuration::minutes(30),
        allocation_mode: None,
        inferences: vec![AllocationInference {
            symbol: Symbol::new("AAPL").unwrap(),
            category: "equity".to_string(),
            intensity: dec!(0.5),
            reason: None,
        }],
    }
}

/// Queue double that records deletes and visibility changes.
#[derive(Debug, Default)]
pub(crate) struct RecordingQueue {
    deleted: Mutex<Vec<ReceiptHandle>>,
    visibility_changes: Mutex<Vec<(ReceiptHandle, u32)>>,
    failing_visibility: bool,
    delete_failures_left: AtomicUsize,
}

impl RecordingQueue {
    pub(crate) fn failing_visibility() -> Self {
        Self {
            failing_visibility: true,
            ..Self::default()
        }
    }

    /// The first `count` deletes fail with a transient error.
    pub(crate) fn failing_deletes(count: usize) -> Self {
        Self {
            delete_failures_left: AtomicUsize::new(count),
            ..Self::default()
        }
    }

    pub(crate) fn deleted(&self) -> Vec<ReceiptHandle> {
        self.deleted.lock().unwrap().clone()
    }

    pub(crate) fn visibility_changes(&self) -> Vec<(ReceiptHandle, u32)> {
        self.visibility_changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageQueue for RecordingQueue {
    async fn delete_message(&self, receipt_handle: &ReceiptHandle) -> Result<(), QueueError> {
        let failed = self
            .delete_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut));
        }

        self.deleted.lock().unwrap().push(receipt_handle.clone());
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt_handle: &ReceiptHandle,
        visibility_timeout_secs: u32,
    ) -> Result<(), QueueError> {
        if self.failing_visibility {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut));
        }

        self.visibility_changes
            .lock()
            .unwrap()
            .push((receipt_handle.clone(), visibility_timeout_secs));
        Ok(())
    }
}

/// Hooks double that records one event name per call.
#[derive(Debug, Default)]
pub(crate) struct RecordingHooks {
    events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ProcessingHooks for RecordingHooks {
    fn on_malformed_message(&self, _message: &QueueMessage, _error: &MalformedMessage) {
        self.record("malformed".to_string());
    }

    fn on_skipped_processing(&self, _key: &IdempotencyKey, reason: SkipReason) {
        self.record(format!("skipped:{reason}"));
    }

    fn on_visibility_extend_failed(&self, _message: &QueueMessage, _error: &QueueError) {
        self.record("visibility_extend_failed".to_string());
    }

    fn on_heartbeat_failed(&self, _key: &IdempotencyKey, _error: &HeartbeatError) {
        self.record("heartbeat_failed".to_string());
    }

    fn on_complete(&self, _key: &IdempotencyKey, _attempt_count: u32) {
        self.record("complete".to_string());
    }

    fn on_error(&self, _key: &IdempotencyKey, _error: &(dyn Error + Send + Sync), retryable: bool) {
        let kind = if retryable { "retryable" } else { "permanent" };
        self.record(format!("error:{kind}"));
    }
}

#[derive(Debug, Default)]
struct Script {
    calls: AtomicUsize,
    next_failure: Mutex<Option<ExecutionError>>,
}

/// Executor double. Clones share the call counter and the scripted failure.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedExecutor {
    script: Arc<Script>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub(crate) fn succeeding() -> Self {
        Self::default()
    }

    /// Fails the first call with `error`, then succeeds.
    pub(crate) fn failing(error: ExecutionError) -> Self {
        Self {
            script: Arc::new(Script {
                calls: AtomicUsize::new(0),
                next_failure: Mutex::new(Some(error)),
            }),
            delay: None,
        }
    }

    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionExecutor for ScriptedExecutor {
    type Item = AllocationInference;
    type Error = ExecutionError;

    async fn execute_locked(
        &self,
        _envelope: &Envelope<AllocationInference>,
        lock: &LockHandle,
    ) -> Result<(), ExecutionError> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        lock.assert_held().await?;

        let failure = self.script.next_failure.lock().unwrap().take();
        failure.map_or(Ok(()), Err)
    }
}

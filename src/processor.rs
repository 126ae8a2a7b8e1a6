//! Per-message state machine: parse, acquire the idempotency key, check
//! expiry, run the executor under the user lock with heartbeats, then
//! finalize the ledger and the queue.
//!
//! A finished outcome is written to the ledger before the queue message is
//! deleted. If the process dies in between, the redelivered copy finds a
//! terminal ledger entry and is dropped without running again.
//!
//! This is the only place that decides whether a failure is permanent.

mod containment;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use serde_json::Value;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::envelope::{Envelope, EnvelopeRules, ItemParser, decode_json, parse_envelope_value};
use crate::error::{LedgerError, LockError, QueueError};
use crate::executor::{DecisionExecutor, NonRetryablePredicate};
use crate::heartbeat::{
    HeartbeatError, defer_message_while_processing, visibility_extension_secs, with_heartbeat,
};
use crate::hooks::{ProcessingHooks, SkipReason};
use crate::ledger::{
    AcquireOutcome, AcquireRequest, IdempotencyKey, LedgerContext, LedgerStatus,
    ProcessingLedger, hash_payload,
};
use crate::lock::{LockHandle, UserLocks, with_user_lock};
use crate::queue::{MessageQueue, QueueMessage};

const DELETE_MAX_RETRIES: usize = 2;

/// Picks a user id for a message that failed validation.
pub type UserIdResolver = Arc<dyn Fn(Option<&Value>) -> String + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub rules: EnvelopeRules,
    pub heartbeat_interval: Duration,
}

/// Shared infrastructure a processor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn ProcessingLedger>,
    pub queue: Arc<dyn MessageQueue>,
    pub locks: Arc<dyn UserLocks>,
    pub hooks: Arc<dyn ProcessingHooks>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Succeeded { attempt_count: u32 },
    Malformed,
    DuplicateInProgress { status: LedgerStatus },
    DuplicateTerminal { status: LedgerStatus },
    Expired,
    LockBusy,
    NonRetryableFailure { attempt_count: u32 },
}

/// Failures the queue should answer with redelivery.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("Execution lock failed for {key}: {source}")]
    Lock {
        key: IdempotencyKey,
        #[source]
        source: LockError,
    },
    #[error("Attempt {attempt_count} for {key} failed: {source}")]
    Retryable {
        key: IdempotencyKey,
        attempt_count: u32,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

pub struct MessageProcessor<P, X>
where
    P: ItemParser,
    X: DecisionExecutor<Item = P::Item>,
{
    config: ProcessorConfig,
    parser: P,
    executor: X,
    is_non_retryable: NonRetryablePredicate<X::Error>,
    ledger: Arc<dyn ProcessingLedger>,
    queue: Arc<dyn MessageQueue>,
    locks: Arc<dyn UserLocks>,
    hooks: Arc<dyn ProcessingHooks>,
    resolve_user_id: UserIdResolver,
}

impl<P, X> MessageProcessor<P, X>
where
    P: ItemParser,
    X: DecisionExecutor<Item = P::Item>,
{
    pub fn new(
        config: ProcessorConfig,
        parser: P,
        executor: X,
        is_non_retryable: NonRetryablePredicate<X::Error>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            parser,
            executor,
            is_non_retryable,
            ledger: collaborators.ledger,
            queue: collaborators.queue,
            locks: collaborators.locks,
            hooks: collaborators.hooks,
            resolve_user_id: Arc::new(containment::user_id_from_body),
        }
    }

    #[must_use]
    pub fn with_user_id_resolver(mut self, resolve_user_id: UserIdResolver) -> Self {
        self.resolve_user_id = resolve_user_id;
        self
    }

    #[tracing::instrument(
        skip(self, message),
        fields(message_id = ?message.message_id, receive_count = message.receive_count)
    )]
    pub async fn process(
        &self,
        message: &QueueMessage,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let value = match decode_json(&message.body) {
            Ok(value) => value,
            Err(error) => return Ok(self.contain_malformed(message, None, &error).await),
        };

        let envelope = match parse_envelope_value(&value, &self.config.rules, &self.parser) {
            Ok(envelope) => envelope,
            Err(error) => return Ok(self.contain_malformed(message, Some(&value), &error).await),
        };

        let key = IdempotencyKey {
            module: envelope.module_key,
            message_key: envelope.message_key.clone(),
        };

        let outcome = self
            .ledger
            .acquire(&AcquireRequest {
                key: key.clone(),
                user_id: envelope.user_id.clone(),
                payload_hash: hash_payload(&value),
                generated_at: envelope.generated_at,
                expires_at: envelope.expires_at,
            })
            .await?;

        if !outcome.acquired {
            return self.handle_duplicate(message, &key, outcome).await;
        }

        let context = LedgerContext {
            key,
            user_id: envelope.user_id.clone(),
            attempt_count: outcome.attempt_count,
        };

        if envelope.is_expired_at(Utc::now()) {
            let reason = format!("expired at {}", envelope.expires_at.to_rfc3339());
            self.ledger.mark_stale_skipped(&context, &reason).await?;
            self.delete(message).await?;
            self.hooks
                .on_skipped_processing(&context.key, SkipReason::Expired);
            return Ok(ProcessingOutcome::Expired);
        }

        let locked = with_user_lock(&self.locks, &envelope.user_id, |lock| {
            self.execute_with_heartbeat(message, &context, &envelope, lock)
        })
        .await;

        match locked {
            Ok(Some(Ok(()))) => self.finish_succeeded(message, &context).await,
            Ok(Some(Err(error))) => self.finish_failed(message, &context, error).await,
            Ok(None) => {
                defer_message_while_processing(
                    self.queue.as_ref(),
                    message,
                    self.ledger.processing_stale(),
                    self.hooks.as_ref(),
                )
                .await;
                self.hooks
                    .on_skipped_processing(&context.key, SkipReason::LockBusy);
                Ok(ProcessingOutcome::LockBusy)
            }
            Err(source) => {
                self.ledger
                    .mark_retryable_failed(&context, &source.to_string())
                    .await?;
                self.hooks.on_error(&context.key, &source, true);
                Err(ProcessingError::Lock {
                    key: context.key,
                    source,
                })
            }
        }
    }

    async fn handle_duplicate(
        &self,
        message: &QueueMessage,
        key: &IdempotencyKey,
        outcome: AcquireOutcome,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let status = outcome.status;

        if status.is_terminal() || status == LedgerStatus::StaleSkipped {
            self.delete(message).await?;
            self.hooks
                .on_skipped_processing(key, SkipReason::AlreadyFinished(status));
            return Ok(ProcessingOutcome::DuplicateTerminal { status });
        }

        defer_message_while_processing(
            self.queue.as_ref(),
            message,
            self.ledger.processing_stale(),
            self.hooks.as_ref(),
        )
        .await;
        self.hooks
            .on_skipped_processing(key, SkipReason::InProgress(status));
        Ok(ProcessingOutcome::DuplicateInProgress { status })
    }

    /// Each beat refreshes the ledger entry, keeps the message hidden and
    /// extends the user lease. The three refreshes are independent: one
    /// failing does not skip the others, and every failure is reported.
    async fn execute_with_heartbeat(
        &self,
        message: &QueueMessage,
        context: &LedgerContext,
        envelope: &Envelope<P::Item>,
        lock: LockHandle,
    ) -> Result<(), X::Error> {
        let visibility_secs = visibility_extension_secs(self.ledger.processing_stale());
        let lock = &lock;

        with_heartbeat(
            self.config.heartbeat_interval,
            move || async move {
                let failures: Vec<HeartbeatError> = [
                    self.ledger
                        .heartbeat_processing(context)
                        .await
                        .map_err(HeartbeatError::from),
                    self.queue
                        .change_visibility(&message.receipt_handle, visibility_secs)
                        .await
                        .map_err(HeartbeatError::from),
                    lock.refresh().await.map_err(HeartbeatError::from),
                ]
                .into_iter()
                .filter_map(Result::err)
                .collect();

                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(failures)
                }
            },
            |failures: Vec<HeartbeatError>| {
                for error in &failures {
                    self.hooks.on_heartbeat_failed(&context.key, error);
                }
            },
            self.executor.execute_locked(envelope, lock),
        )
        .await
    }

    async fn finish_succeeded(
        &self,
        message: &QueueMessage,
        context: &LedgerContext,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        self.ledger.mark_succeeded(context).await?;
        self.delete(message).await?;
        self.hooks
            .on_complete(&context.key, context.attempt_count);

        Ok(ProcessingOutcome::Succeeded {
            attempt_count: context.attempt_count,
        })
    }

    async fn finish_failed(
        &self,
        message: &QueueMessage,
        context: &LedgerContext,
        error: X::Error,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        if (self.is_non_retryable)(&error) {
            self.ledger
                .mark_non_retryable_failed(context, &error.to_string())
                .await?;
            self.delete(message).await?;
            self.hooks.on_error(&context.key, &error, false);

            return Ok(ProcessingOutcome::NonRetryableFailure {
                attempt_count: context.attempt_count,
            });
        }

        self.ledger
            .mark_retryable_failed(context, &error.to_string())
            .await?;
        self.hooks.on_error(&context.key, &error, true);

        Err(ProcessingError::Retryable {
            key: context.key.clone(),
            attempt_count: context.attempt_count,
            source: Box::new(error),
        })
    }

    /// Deletes with a few quick retries. A receipt the queue no longer
    /// recognizes is not retried: the message was already redelivered.
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let receipt_handle = &message.receipt_handle;

        (|| async { self.queue.delete_message(receipt_handle).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(50))
                    .with_max_times(DELETE_MAX_RETRIES),
            )
            .when(|error| !matches!(error, QueueError::UnknownReceipt(_)))
            .notify(|error, delay| {
                warn!(%receipt_handle, %error, ?delay, "Retrying message delete");
            })
            .await?;

        info!(%receipt_handle, "Message deleted");
        Ok(())
    }
}

//! Receive loop feeding the processor.

use futures_util::stream::{self, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::WorkerCtx;
use crate::envelope::ItemParser;
use crate::error::QueueError;
use crate::executor::DecisionExecutor;
use crate::heartbeat::visibility_extension_secs;
use crate::processor::{MessageProcessor, ProcessingOutcome};
use crate::queue::SqliteQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub batch_size: u32,
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// How long a received message stays hidden before the first heartbeat
    /// extends it.
    pub visibility_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_ctx(worker: &WorkerCtx) -> Self {
        Self {
            batch_size: worker.batch_size,
            concurrency: worker.concurrency,
            poll_interval: worker.poll_interval,
            visibility_timeout: Duration::from_secs(u64::from(visibility_extension_secs(
                worker.processing_stale,
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub succeeded: usize,
    /// Removed from the queue without a successful execution.
    pub dropped: usize,
    /// Left on the queue for later redelivery.
    pub deferred: usize,
    pub failed: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: ProcessingOutcome) {
        match outcome {
            ProcessingOutcome::Succeeded { .. } => self.succeeded += 1,
            ProcessingOutcome::Malformed
            | ProcessingOutcome::DuplicateTerminal { .. }
            | ProcessingOutcome::Expired
            | ProcessingOutcome::NonRetryableFailure { .. } => self.dropped += 1,
            ProcessingOutcome::DuplicateInProgress { .. } | ProcessingOutcome::LockBusy => {
                self.deferred += 1;
            }
        }
    }
}

/// Receives one batch and processes it with bounded concurrency. Only a
/// failed receive is an error; per-message failures are logged and counted.
#[tracing::instrument(skip_all, level = tracing::Level::DEBUG)]
pub async fn process_batch<P, X>(
    queue: &SqliteQueue,
    processor: &MessageProcessor<P, X>,
    settings: &WorkerSettings,
) -> Result<BatchSummary, QueueError>
where
    P: ItemParser,
    X: DecisionExecutor<Item = P::Item>,
{
    let messages = queue
        .receive(settings.batch_size, settings.visibility_timeout)
        .await?;

    let mut summary = BatchSummary {
        received: messages.len(),
        ..BatchSummary::default()
    };

    let results = stream::iter(messages)
        .map(|message| async move {
            let result = processor.process(&message).await;
            (message, result)
        })
        .buffer_unordered(settings.concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    for (message, result) in results {
        match result {
            Ok(outcome) => {
                debug!(message_id = ?message.message_id, ?outcome, "Message handled");
                summary.record(outcome);
            }
            Err(error) => {
                warn!(
                    message_id = ?message.message_id,
                    receive_count = message.receive_count,
                    %error,
                    "Message left for redelivery"
                );
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

/// Polls forever. Sleeps `poll_interval` whenever a batch comes back empty
/// or the receive itself fails.
pub async fn run_worker<P, X>(
    queue: &SqliteQueue,
    processor: &MessageProcessor<P, X>,
    settings: WorkerSettings,
) -> Infallible
where
    P: ItemParser,
    X: DecisionExecutor<Item = P::Item>,
{
    info!(
        batch_size = settings.batch_size,
        concurrency = settings.concurrency,
        "Worker started"
    );

    loop {
        match process_batch(queue, processor, &settings).await {
            Ok(summary) if summary.received == 0 => {
                tokio::time::sleep(settings.poll_interval).await;
            }
            Ok(summary) => {
                info!(
                    received = summary.received,
                    succeeded = summary.succeeded,
                    dropped = summary.dropped,
                    deferred = summary.deferred,
                    failed = summary.failed,
                    "Batch processed"
                );
            }
            Err(e) => {
                error!("Failed to receive messages: {e}");
                tokio::time::sleep(settings.poll_interval).await;
            }
        }
    }
}

//! Business-logic seam. The worker owns delivery, dedupe and locking; an
//! executor only applies one envelope while holding the user lock.

use async_trait::async_trait;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::envelope::Envelope;
use crate::error::LockError;
use crate::lock::LockHandle;

#[async_trait]
pub trait DecisionExecutor: Send + Sync + 'static {
    type Item: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Applies `envelope`. Implementations should call
    /// [`LockHandle::assert_held`] before any side effect that must not be
    /// duplicated.
    async fn execute_locked(
        &self,
        envelope: &Envelope<Self::Item>,
        lock: &LockHandle,
    ) -> Result<(), Self::Error>;
}

/// Decides whether an executor error is permanent. Anything it rejects is
/// retried through queue redelivery.
pub type NonRetryablePredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{resource} not found")]
    NotFound { resource: String },
    #[error("Decision rejected: {reason}")]
    Rejected { reason: String },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("Execution failed: {0}")]
    Failed(String),
}

impl ExecutionError {
    pub const fn is_non_retryable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Rejected { .. })
    }
}

pub fn default_non_retryable() -> NonRetryablePredicate<ExecutionError> {
    Arc::new(ExecutionError::is_non_retryable)
}

/// Logs what it would apply without touching any trading backend.
pub struct DryRunExecutor<T> {
    executions: Arc<AtomicU64>,
    _item: PhantomData<fn() -> T>,
}

impl<T> DryRunExecutor<T> {
    pub fn new() -> Self {
        Self {
            executions: Arc::new(AtomicU64::new(0)),
            _item: PhantomData,
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }
}

impl<T> Default for DryRunExecutor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for DryRunExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            executions: Arc::clone(&self.executions),
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T> DecisionExecutor for DryRunExecutor<T>
where
    T: Debug + Send + Sync + 'static,
{
    type Item = T;
    type Error = ExecutionError;

    async fn execute_locked(
        &self,
        envelope: &Envelope<T>,
        lock: &LockHandle,
    ) -> Result<(), ExecutionError> {
        lock.assert_held().await?;

        for inference in &envelope.inferences {
            info!(
                module = %envelope.module,
                message_key = %envelope.message_key,
                user_id = %envelope.user_id,
                "[DRY RUN] Would apply {inference:?}"
            );
        }

        let count = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            run_id = %envelope.run_id,
            inferences = envelope.inferences.len(),
            count,
            "[DRY RUN] Decision applied"
        );

        Ok(())
    }
}

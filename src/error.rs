//! Infrastructure error types shared by the ledger, queue and lock layers.
//! None of these classify failures as retryable or not; that decision
//! belongs to the processor.

use std::num::TryFromIntError;

use crate::module::ModuleKind;

/// Idempotency ledger persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("No ledger entry for {module}/{message_key}")]
    EntryNotFound {
        module: ModuleKind,
        message_key: String,
    },
    #[error("Corrupt ledger status '{0}'")]
    InvalidStatus(String),
    #[error("Corrupt ledger module '{0}'")]
    InvalidModule(String),
    #[error("Corrupt ledger timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("Attempt count out of range: {0}")]
    AttemptCount(#[from] TryFromIntError),
}

/// Queue adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Receipt handle {0} is not current for any in-flight message")]
    UnknownReceipt(String),
    #[error("Message {0} already exists")]
    DuplicateMessageId(String),
    #[error("Numeric conversion error: {0}")]
    Conversion(#[from] TryFromIntError),
}

/// Per-user execution lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Execution lock for user {user_id} is no longer held")]
    Lost { user_id: String },
}

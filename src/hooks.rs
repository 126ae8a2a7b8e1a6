//! Observability hooks called by the processor. Side-effect only: nothing a
//! hook does can change how a message is handled.
//!
//! Every method has a default that logs through `tracing`, so an
//! implementation only overrides what it wants to forward elsewhere.

use std::error::Error;
use std::fmt::{Display, Formatter};
use tracing::{error, info, warn};

use crate::envelope::MalformedMessage;
use crate::error::QueueError;
use crate::heartbeat::HeartbeatError;
use crate::ledger::{IdempotencyKey, LedgerStatus};
use crate::queue::QueueMessage;

/// Why a parsed message was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another attempt holds the key, or a retry window is still open.
    InProgress(LedgerStatus),
    /// The key already finished.
    AlreadyFinished(LedgerStatus),
    Expired,
    LockBusy,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress(status) => write!(f, "duplicate in progress ({status})"),
            Self::AlreadyFinished(status) => write!(f, "duplicate of finished work ({status})"),
            Self::Expired => f.write_str("expired"),
            Self::LockBusy => f.write_str("user lock busy"),
        }
    }
}

pub trait ProcessingHooks: Send + Sync {
    fn on_malformed_message(&self, message: &QueueMessage, error: &MalformedMessage) {
        warn!(
            message_id = ?message.message_id,
            receive_count = message.receive_count,
            %error,
            "Malformed message"
        );
    }

    fn on_skipped_processing(&self, key: &IdempotencyKey, reason: SkipReason) {
        info!(%key, %reason, "Skipped processing");
    }

    fn on_visibility_extend_failed(&self, message: &QueueMessage, error: &QueueError) {
        warn!(
            message_id = ?message.message_id,
            %error,
            "Failed to extend message visibility"
        );
    }

    fn on_heartbeat_failed(&self, key: &IdempotencyKey, error: &HeartbeatError) {
        warn!(%key, %error, "Heartbeat failed");
    }

    fn on_complete(&self, key: &IdempotencyKey, attempt_count: u32) {
        info!(%key, attempt_count, "Processing complete");
    }

    fn on_error(&self, key: &IdempotencyKey, error: &(dyn Error + Send + Sync), retryable: bool) {
        error!(%key, %error, retryable, "Processing failed");
    }
}

/// Hooks that only log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

impl ProcessingHooks for TracingHooks {}

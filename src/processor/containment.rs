//! Poison message handling. A message that fails validation is recorded as
//! permanently failed under a best-effort key and always deleted, so it can
//! never loop through the queue.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use super::{MessageProcessor, ProcessingOutcome};
use crate::envelope::{ItemParser, MalformedMessage};
use crate::executor::DecisionExecutor;
use crate::ledger::{AcquireRequest, IdempotencyKey, LedgerContext, hash_payload};
use crate::queue::QueueMessage;

const UNKNOWN_USER: &str = "unknown";

impl<P, X> MessageProcessor<P, X>
where
    P: ItemParser,
    X: DecisionExecutor<Item = P::Item>,
{
    /// Never fails: ledger and queue errors here are logged and the message
    /// is still reported as contained.
    pub(super) async fn contain_malformed(
        &self,
        message: &QueueMessage,
        value: Option<&Value>,
        error: &MalformedMessage,
    ) -> ProcessingOutcome {
        self.hooks.on_malformed_message(message, error);

        let key = IdempotencyKey {
            module: self.config.rules.module,
            message_key: derive_message_key(message, value),
        };
        let user_id = (self.resolve_user_id)(value);
        let payload_hash = value.map_or_else(
            || hash_payload(&Value::String(message.body.clone())),
            hash_payload,
        );
        let now = Utc::now();

        let request = AcquireRequest {
            key: key.clone(),
            user_id: user_id.clone(),
            payload_hash,
            generated_at: now,
            expires_at: now,
        };

        match self.ledger.acquire(&request).await {
            Ok(outcome) if outcome.acquired => {
                let context = LedgerContext {
                    key: key.clone(),
                    user_id,
                    attempt_count: outcome.attempt_count,
                };

                if let Err(ledger_error) = self
                    .ledger
                    .mark_non_retryable_failed(&context, &error.to_string())
                    .await
                {
                    warn!(%key, %ledger_error, "Failed to record malformed message");
                }
            }
            Ok(outcome) => {
                debug!(%key, status = %outcome.status, "Malformed message key already recorded");
            }
            Err(ledger_error) => {
                warn!(%key, %ledger_error, "Failed to acquire ledger entry for malformed message");
            }
        }

        if let Err(queue_error) = self.delete(message).await {
            warn!(%key, %queue_error, "Failed to delete malformed message");
        }

        ProcessingOutcome::Malformed
    }
}

/// `messageKey` from the body when usable, else the queue's message id, else
/// a key derived from the raw body.
fn derive_message_key(message: &QueueMessage, value: Option<&Value>) -> String {
    let from_body = value
        .and_then(|value| value.get("messageKey"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|key| !key.is_empty());

    if let Some(key) = from_body {
        return key.to_string();
    }

    if let Some(message_id) = message
        .message_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
    {
        return message_id.to_string();
    }

    format!(
        "malformed-{}",
        hash_payload(&Value::String(message.body.clone()))
    )
}

pub(super) fn user_id_from_body(value: Option<&Value>) -> String {
    value
        .and_then(|value| value.get("userId"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|user_id| !user_id.is_empty())
        .unwrap_or(UNKNOWN_USER)
        .to_string()
}

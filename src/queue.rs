//! Visibility-timeout message queue.
//!
//! The processor only needs [`MessageQueue`] (delete and change visibility by
//! receipt handle). [`SqliteQueue`] adds sending and receiving so the worker
//! can run against a local database with the same at-least-once semantics as
//! a hosted queue: a received message is hidden for the visibility timeout
//! and comes back with a fresh receipt handle unless it is deleted first.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::QueueError;
use crate::ledger::{duration_ms, now_ms};

/// Opaque token for one delivery of a message. Only the most recent receipt
/// for a message is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl Display for ReceiptHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    pub receipt_handle: ReceiptHandle,
    pub body: String,
    pub receive_count: u32,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn delete_message(&self, receipt_handle: &ReceiptHandle) -> Result<(), QueueError>;

    /// Hides the message for `visibility_timeout_secs` from now.
    async fn change_visibility(
        &self,
        receipt_handle: &ReceiptHandle,
        visibility_timeout_secs: u32,
    ) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ReceivedRow {
    id: i64,
    message_id: String,
    body: String,
    receipt_handle: String,
    receive_count: i64,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueues `body`, visible immediately. A missing `message_id` gets a
    /// random one.
    #[tracing::instrument(skip(self, body), level = tracing::Level::DEBUG)]
    pub async fn send_message(
        &self,
        body: &str,
        message_id: Option<&str>,
    ) -> Result<String, QueueError> {
        let message_id = message_id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_messages (message_id, body, visible_at_ms)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(&message_id)
        .bind(body)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::DuplicateMessageId(message_id));
        }

        info!(%message_id, "Enqueued message");
        Ok(message_id)
    }

    /// Claims up to `max_messages` visible messages in enqueue order and
    /// hides them for `visibility_timeout`. The claim is one statement, so
    /// concurrent receivers never get the same delivery.
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    pub async fn receive(
        &self,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let receipt_prefix = Uuid::new_v4().to_string();

        let mut rows: Vec<ReceivedRow> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET visible_at_ms = ?1,
                receive_count = receive_count + 1,
                receipt_handle = ?2 || ':' || id
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE visible_at_ms <= ?3
                ORDER BY id ASC
                LIMIT ?4
            )
            RETURNING id, message_id, body, receipt_handle, receive_count
            "#,
        )
        .bind(now.saturating_add(duration_ms(visibility_timeout)))
        .bind(&receipt_prefix)
        .bind(now)
        .bind(i64::from(max_messages))
        .fetch_all(&self.pool)
        .await?;

        rows.sort_unstable_by_key(|row| row.id);

        let messages = rows
            .into_iter()
            .map(|row| {
                Ok(QueueMessage {
                    message_id: Some(row.message_id),
                    receipt_handle: ReceiptHandle(row.receipt_handle),
                    body: row.body,
                    receive_count: u32::try_from(row.receive_count)?,
                })
            })
            .collect::<Result<Vec<_>, QueueError>>()?;

        if !messages.is_empty() {
            debug!(count = messages.len(), "Received messages");
        }

        Ok(messages)
    }

    /// Messages currently visible to receivers.
    pub async fn visible_count(&self) -> Result<i64, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE visible_at_ms <= ?1")
                .bind(now_ms())
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    /// All messages not yet deleted, in flight or not.
    pub async fn total_count(&self) -> Result<i64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    async fn delete_message(&self, receipt_handle: &ReceiptHandle) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE receipt_handle = ?1")
            .bind(&receipt_handle.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(receipt_handle.0.clone()));
        }

        debug!(%receipt_handle, "Deleted message");
        Ok(())
    }

    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    async fn change_visibility(
        &self,
        receipt_handle: &ReceiptHandle,
        visibility_timeout_secs: u32,
    ) -> Result<(), QueueError> {
        let visible_at =
            now_ms().saturating_add(i64::from(visibility_timeout_secs).saturating_mul(1000));

        let result =
            sqlx::query("UPDATE queue_messages SET visible_at_ms = ?1 WHERE receipt_handle = ?2")
                .bind(visible_at)
                .bind(&receipt_handle.0)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(receipt_handle.0.clone()));
        }

        Ok(())
    }
}

//! Per-user execution lock.
//!
//! Two messages for the same user never run business logic at the same
//! time, even with different message keys. A lease row is keyed by user and
//! scoped by a random token; leases not refreshed within the TTL are cleared
//! by the next acquirer.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::ledger::{duration_ms, now_ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLease {
    pub user_id: String,
    pub token: String,
}

#[async_trait]
pub trait UserLocks: Send + Sync {
    /// `None` means the lock is held elsewhere.
    async fn try_acquire(&self, user_id: &str) -> Result<Option<UserLease>, LockError>;

    /// Extends the lease. `false` when the lease is gone.
    async fn refresh(&self, lease: &UserLease) -> Result<bool, LockError>;

    async fn is_held(&self, lease: &UserLease) -> Result<bool, LockError>;

    async fn release(&self, lease: &UserLease) -> Result<(), LockError>;
}

#[derive(Debug, Clone)]
pub struct SqliteUserLocks {
    pool: SqlitePool,
    lease_ttl: Duration,
}

impl SqliteUserLocks {
    pub fn new(pool: SqlitePool, lease_ttl: Duration) -> Self {
        Self { pool, lease_ttl }
    }
}

#[async_trait]
impl UserLocks for SqliteUserLocks {
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    async fn try_acquire(&self, user_id: &str) -> Result<Option<UserLease>, LockError> {
        let now = now_ms();
        let expired_before = now.saturating_sub(duration_ms(self.lease_ttl));
        let token = Uuid::new_v4().to_string();

        let mut sql_tx = self.pool.begin().await?;

        let cleanup = sqlx::query("DELETE FROM user_locks WHERE user_id = ?1 AND refreshed_at_ms < ?2")
            .bind(user_id)
            .bind(expired_before)
            .execute(sql_tx.as_mut())
            .await?;

        if cleanup.rows_affected() > 0 {
            info!(user_id, "Cleared expired execution lease");
        }

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO user_locks (user_id, token, acquired_at_ms, refreshed_at_ms)
            VALUES (?1, ?2, ?3, ?3)
            "#,
        )
        .bind(user_id)
        .bind(&token)
        .bind(now)
        .execute(sql_tx.as_mut())
        .await?;

        sql_tx.commit().await?;

        if result.rows_affected() == 0 {
            debug!(user_id, "Execution lease already held");
            return Ok(None);
        }

        debug!(user_id, "Acquired execution lease");
        Ok(Some(UserLease {
            user_id: user_id.to_string(),
            token,
        }))
    }

    async fn refresh(&self, lease: &UserLease) -> Result<bool, LockError> {
        let result = sqlx::query(
            "UPDATE user_locks SET refreshed_at_ms = ?1 WHERE user_id = ?2 AND token = ?3",
        )
        .bind(now_ms())
        .bind(&lease.user_id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn is_held(&self, lease: &UserLease) -> Result<bool, LockError> {
        let held: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM user_locks WHERE user_id = ?1 AND token = ?2")
                .bind(&lease.user_id)
                .bind(&lease.token)
                .fetch_optional(&self.pool)
                .await?;

        Ok(held.is_some())
    }

    async fn release(&self, lease: &UserLease) -> Result<(), LockError> {
        sqlx::query("DELETE FROM user_locks WHERE user_id = ?1 AND token = ?2")
            .bind(&lease.user_id)
            .bind(&lease.token)
            .execute(&self.pool)
            .await?;

        debug!(user_id = %lease.user_id, "Released execution lease");
        Ok(())
    }
}

/// A lease held for the duration of one locked callback.
#[derive(Clone)]
pub struct LockHandle {
    locks: Arc<dyn UserLocks>,
    lease: UserLease,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    pub fn new(locks: Arc<dyn UserLocks>, lease: UserLease) -> Self {
        Self { locks, lease }
    }

    pub fn user_id(&self) -> &str {
        &self.lease.user_id
    }

    /// Call before side effects that must not happen without the lock.
    pub async fn assert_held(&self) -> Result<(), LockError> {
        if self.locks.is_held(&self.lease).await? {
            Ok(())
        } else {
            Err(self.lost())
        }
    }

    pub async fn refresh(&self) -> Result<(), LockError> {
        if self.locks.refresh(&self.lease).await? {
            Ok(())
        } else {
            Err(self.lost())
        }
    }

    fn lost(&self) -> LockError {
        LockError::Lost {
            user_id: self.lease.user_id.clone(),
        }
    }
}

/// Runs `callback` while holding the lock for `user_id`. `Ok(None)` means
/// the lock was busy and `callback` never ran. The lease is released on
/// every exit; a failed release only logs since the TTL clears it anyway.
pub async fn with_user_lock<T, F, Fut>(
    locks: &Arc<dyn UserLocks>,
    user_id: &str,
    callback: F,
) -> Result<Option<T>, LockError>
where
    F: FnOnce(LockHandle) -> Fut,
    Fut: Future<Output = T>,
{
    let Some(lease) = locks.try_acquire(user_id).await? else {
        return Ok(None);
    };

    let output = callback(LockHandle::new(Arc::clone(locks), lease.clone())).await;

    if let Err(error) = locks.release(&lease).await {
        warn!(user_id, %error, "Failed to release execution lease");
    }

    Ok(Some(output))
}

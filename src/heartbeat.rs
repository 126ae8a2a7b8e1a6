//! Liveness for in-flight work and visibility deferral for work that has to
//! wait.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;

use crate::error::{LedgerError, LockError, QueueError};
use crate::hooks::ProcessingHooks;
use crate::queue::{MessageQueue, QueueMessage};

/// A failed heartbeat tick. Reported through hooks, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Ledger heartbeat failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Visibility extension failed: {0}")]
    Queue(#[from] QueueError),
    #[error("Lease refresh failed: {0}")]
    Lock(#[from] LockError),
}

/// Runs `callback` with `heartbeat` firing once up front and then every
/// `interval` until `callback` settles.
///
/// The first beat is awaited before `callback` starts. Later beats run on
/// the same task as `callback` without blocking it. A failing beat goes to
/// `on_failure` and the timer keeps going. The timer lives inside this call
/// and stops on every exit path, including when the returned future is
/// dropped.
pub async fn with_heartbeat<T, E, H, HFut, F, C>(
    interval: Duration,
    mut heartbeat: H,
    mut on_failure: F,
    callback: C,
) -> T
where
    H: FnMut() -> HFut,
    HFut: Future<Output = Result<(), E>>,
    F: FnMut(E),
    C: Future<Output = T>,
{
    if let Err(error) = heartbeat().await {
        on_failure(error);
    }

    tokio::pin!(callback);

    tokio::select! {
        biased;
        output = &mut callback => output,
        never = beat_forever(interval, &mut heartbeat, &mut on_failure) => match never {},
    }
}

async fn beat_forever<E, H, HFut, F>(
    interval: Duration,
    heartbeat: &mut H,
    on_failure: &mut F,
) -> Infallible
where
    H: FnMut() -> HFut,
    HFut: Future<Output = Result<(), E>>,
    F: FnMut(E),
{
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(error) = heartbeat().await {
            on_failure(error);
        }
    }
}

/// Seconds to hide a message that must wait: the staleness threshold rounded
/// up, at least one second.
pub fn visibility_extension_secs(processing_stale: Duration) -> u32 {
    let millis = processing_stale.as_millis();
    let secs = millis.div_ceil(1000).max(1);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Leaves `message` on the queue for later redelivery. Returns whether the
/// extension landed; a failure goes to hooks and the queue simply redelivers
/// sooner.
pub async fn defer_message_while_processing(
    queue: &dyn MessageQueue,
    message: &QueueMessage,
    processing_stale: Duration,
    hooks: &dyn ProcessingHooks,
) -> bool {
    let secs = visibility_extension_secs(processing_stale);

    match queue.change_visibility(&message.receipt_handle, secs).await {
        Ok(()) => {
            debug!(receipt_handle = %message.receipt_handle, secs, "Deferred message");
            true
        }
        Err(error) => {
            hooks.on_visibility_extend_failed(message, &error);
            false
        }
    }
}

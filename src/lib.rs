use sqlx::SqlitePool;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{Instrument, Level, error, info, info_span};

pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod hooks;
pub mod inference;
pub mod ledger;
pub mod lock;
pub mod module;
pub mod processor;
pub mod queue;
mod telemetry;
pub mod worker;

pub use telemetry::{TelemetryError, TelemetryGuard};

#[cfg(test)]
pub mod test_utils;

use crate::config::{Ctx, LogLevel};
use crate::envelope::ItemParser;
use crate::executor::{DryRunExecutor, default_non_retryable};
use crate::hooks::TracingHooks;
use crate::inference::{AllocationItemParser, RiskItemParser};
use crate::ledger::SqliteLedger;
use crate::lock::SqliteUserLocks;
use crate::module::ModuleKind;
use crate::processor::{Collaborators, MessageProcessor, ProcessorConfig};
use crate::queue::SqliteQueue;
use crate::worker::{WorkerSettings, run_worker};

pub(crate) fn default_log_filter(log_level: &LogLevel) -> String {
    let level: Level = log_level.into();
    format!("st0x_decisions={level}")
}

pub fn setup_tracing(log_level: &LogLevel) {
    let default_filter = default_log_filter(log_level);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

pub async fn launch(ctx: Ctx) -> anyhow::Result<()> {
    let launch_span = info_span!("launch", module = %ctx.worker.module);
    let _enter = launch_span.enter();

    let pool = ctx.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let worker_task = match ctx.worker.module {
        ModuleKind::Allocation => spawn_worker_task(&ctx, pool, AllocationItemParser),
        ModuleKind::Risk => spawn_worker_task(&ctx, pool, RiskItemParser),
    };

    await_shutdown(worker_task).await;

    info!("Shutdown complete");
    Ok(())
}

fn spawn_worker_task<P>(ctx: &Ctx, pool: SqlitePool, parser: P) -> JoinHandle<Infallible>
where
    P: ItemParser + 'static,
    P::Item: 'static,
{
    let queue = SqliteQueue::new(pool.clone());
    let settings = WorkerSettings::from_ctx(&ctx.worker);

    info!("Initializing dry-run executor");
    let processor = MessageProcessor::new(
        ProcessorConfig {
            rules: ctx.envelope_rules(),
            heartbeat_interval: ctx.worker.heartbeat_interval,
        },
        parser,
        DryRunExecutor::<P::Item>::new(),
        default_non_retryable(),
        Collaborators {
            ledger: Arc::new(SqliteLedger::new(pool.clone(), ctx.ledger_config())),
            queue: Arc::new(queue.clone()),
            locks: Arc::new(SqliteUserLocks::new(pool, ctx.worker.lock_lease)),
            hooks: Arc::new(TracingHooks),
        },
    );

    tokio::spawn(
        async move { run_worker(&queue, &processor, settings).await }
            .instrument(info_span!("worker_task")),
    )
}

async fn await_shutdown(worker_task: JoinHandle<Infallible>) {
    let worker_abort = worker_task.abort_handle();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
            abort_task("worker", &worker_abort);
        }
        result = worker_task => log_worker_result(result),
    }
}

fn abort_task(name: &str, handle: &AbortHandle) {
    info!("Aborting {name} task");
    handle.abort();
}

fn log_worker_result(result: Result<Infallible, JoinError>) {
    match result {
        Ok(never) => match never {},
        Err(e) => error!("Worker task panicked: {e}"),
    }
}

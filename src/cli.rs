use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::config::{Ctx, Env};
use crate::envelope::decode_json;
use crate::ledger::{LedgerEntry, SqliteLedger};
use crate::module::ModuleKind;
use crate::queue::SqliteQueue;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Unknown module '{0}'")]
    UnknownModule(String),
    #[error("No ledger entry for {module}/{key}")]
    EntryNotFound { module: ModuleKind, key: String },
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Enqueue a decision envelope from a JSON file
    Enqueue {
        /// Path to the JSON envelope
        #[arg(long)]
        file: PathBuf,
        /// Queue message id (random when omitted)
        #[arg(long = "message-id")]
        message_id: Option<String>,
    },
    /// Show the ledger entry for an idempotency key
    Ledger {
        /// Module name, canonical or alias
        #[arg(long)]
        module: String,
        /// Message key
        #[arg(long)]
        key: String,
    },
    /// Show queue depth
    QueueDepth,
}

#[derive(Debug, Parser)]
#[command(name = "decisions-cli")]
#[command(about = "Operator tooling for the decision queue worker")]
#[command(version)]
pub struct CliEnv {
    #[clap(flatten)]
    env: Env,
    #[command(subcommand)]
    pub command: Commands,
}

impl CliEnv {
    /// Parse CLI arguments and load runtime settings
    pub fn parse_and_convert() -> anyhow::Result<(Ctx, Commands)> {
        let cli = Self::parse();
        let ctx = Ctx::load_files(&cli.env.config, cli.env.secrets.as_deref())?;
        Ok((ctx, cli.command))
    }
}

pub async fn run_command(ctx: Ctx, command: Commands) -> anyhow::Result<()> {
    let pool = ctx.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let mut stdout = std::io::stdout();
    run_command_with_writers(&ctx, &pool, command, &mut stdout).await
}

async fn run_command_with_writers<W: Write>(
    ctx: &Ctx,
    pool: &SqlitePool,
    command: Commands,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::Enqueue { file, message_id } => {
            let body = std::fs::read_to_string(&file)?;
            decode_json(&body)?;

            let queue = SqliteQueue::new(pool.clone());
            let message_id = queue.send_message(&body, message_id.as_deref()).await?;

            info!(%message_id, file = %file.display(), "Enqueued envelope");
            writeln!(stdout, "Enqueued message {message_id}")?;
        }
        Commands::Ledger { module, key } => {
            let module = ctx
                .aliases
                .resolve(&module)
                .ok_or(CliError::UnknownModule(module))?;

            let ledger = SqliteLedger::new(pool.clone(), ctx.ledger_config());
            let entry = ledger
                .get_entry(module, &key)
                .await?
                .ok_or(CliError::EntryNotFound { module, key })?;

            display_entry(stdout, &entry)?;
        }
        Commands::QueueDepth => {
            let queue = SqliteQueue::new(pool.clone());
            let visible = queue.visible_count().await?;
            let total = queue.total_count().await?;

            writeln!(stdout, "Visible: {visible}")?;
            writeln!(stdout, "In flight: {}", total - visible)?;
            writeln!(stdout, "Total: {total}")?;
        }
    }

    Ok(())
}

fn display_entry<W: Write>(stdout: &mut W, entry: &LedgerEntry) -> std::io::Result<()> {
    writeln!(stdout, "Key: {}", entry.key)?;
    writeln!(stdout, "User: {}", entry.user_id)?;
    writeln!(stdout, "Status: {}", entry.status)?;
    writeln!(stdout, "Attempts: {}", entry.attempt_count)?;
    writeln!(stdout, "Payload hash: {}", entry.payload_hash)?;
    writeln!(stdout, "Generated at: {}", entry.generated_at.to_rfc3339())?;
    writeln!(stdout, "Expires at: {}", entry.expires_at.to_rfc3339())?;
    writeln!(stdout, "Last heartbeat: {}", entry.heartbeat_at.to_rfc3339())?;
    writeln!(stdout, "Updated at: {}", entry.updated_at.to_rfc3339())?;
    if let Some(error) = &entry.error {
        writeln!(stdout, "Error: {error}")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    use crate::ledger::{AcquireRequest, IdempotencyKey, ProcessingLedger};
    use crate::test_utils::{envelope_json, setup_test_db};

    fn ctx() -> Ctx {
        Ctx::from_toml(
            r#"
                database_url = "sqlite::memory:"
                [worker]
                module = "allocation"
            "#,
            None,
        )
        .unwrap()
    }

    fn output(buffer: Vec<u8>) -> String {
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn verify_cli() {
        CliEnv::command().debug_assert();
    }

    #[test]
    fn parses_ledger_command() {
        let cli = CliEnv::try_parse_from([
            "decisions-cli",
            "--config",
            "config.toml",
            "ledger",
            "--module",
            "rebalance",
            "--key",
            "run-1:user-1",
        ])
        .unwrap();

        assert!(matches!(
            cli.command,
            Commands::Ledger { ref module, ref key } if module == "rebalance" && key == "run-1:user-1"
        ));
        assert!(cli.env.secrets.is_none());
    }

    #[tokio::test]
    async fn enqueue_then_queue_depth() {
        let pool = setup_test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("envelope.json");
        std::fs::write(&file, envelope_json("allocation", "key-1", "user-1").to_string()).unwrap();

        let mut stdout = Vec::new();
        run_command_with_writers(
            &ctx(),
            &pool,
            Commands::Enqueue {
                file,
                message_id: Some("msg-1".to_string()),
            },
            &mut stdout,
        )
        .await
        .unwrap();
        assert_eq!(output(stdout), "Enqueued message msg-1\n");

        let mut stdout = Vec::new();
        run_command_with_writers(&ctx(), &pool, Commands::QueueDepth, &mut stdout)
            .await
            .unwrap();
        assert_eq!(output(stdout), "Visible: 1\nIn flight: 0\nTotal: 1\n");
    }

    #[tokio::test]
    async fn enqueue_rejects_non_object_json() {
        let pool = setup_test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("envelope.json");
        std::fs::write(&file, "[1, 2]").unwrap();

        let mut stdout = Vec::new();
        let result = run_command_with_writers(
            &ctx(),
            &pool,
            Commands::Enqueue {
                file,
                message_id: None,
            },
            &mut stdout,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(SqliteQueue::new(pool).total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ledger_command_resolves_aliases() {
        let pool = setup_test_db().await;
        let ctx = ctx();
        let generated_at = chrono::Utc::now();
        SqliteLedger::new(pool.clone(), ctx.ledger_config())
            .acquire(&AcquireRequest {
                key: IdempotencyKey {
                    module: ModuleKind::Allocation,
                    message_key: "key-1".to_string(),
                },
                user_id: "user-1".to_string(),
                payload_hash: "abc".to_string(),
                generated_at,
                expires_at: generated_at,
            })
            .await
            .unwrap();

        let mut stdout = Vec::new();
        run_command_with_writers(
            &ctx,
            &pool,
            Commands::Ledger {
                module: "rebalance".to_string(),
                key: "key-1".to_string(),
            },
            &mut stdout,
        )
        .await
        .unwrap();

        let printed = output(stdout);
        assert!(printed.contains("Key: allocation/key-1"));
        assert!(printed.contains("Status: processing"));
        assert!(printed.contains("Attempts: 1"));
    }

    #[tokio::test]
    async fn ledger_command_reports_missing_entry() {
        let pool = setup_test_db().await;

        let error = run_command_with_writers(
            &ctx(),
            &pool,
            Commands::Ledger {
                module: "risk".to_string(),
                key: "missing".to_string(),
            },
            &mut Vec::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<CliError>(),
            Some(CliError::EntryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn ledger_command_rejects_unknown_module() {
        let pool = setup_test_db().await;

        let error = run_command_with_writers(
            &ctx(),
            &pool,
            Commands::Ledger {
                module: "portfolio".to_string(),
                key: "key-1".to_string(),
            },
            &mut Vec::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(error.to_string(), "Unknown module 'portfolio'");
    }
}

//! Operator commands: enqueue envelopes, inspect the ledger and the queue.

use st0x_decisions::cli;
use st0x_decisions::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (ctx, command) = cli::CliEnv::parse_and_convert()?;
    setup_tracing(&ctx.log_level);

    cli::run_command(ctx, command).await?;
    Ok(())
}

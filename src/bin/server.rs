use clap::Parser;
use st0x_decisions::config::{Ctx, Env};
use st0x_decisions::{launch, setup_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = Env::parse();
    let ctx = Ctx::load_files(&env.config, env.secrets.as_deref())?;

    let telemetry_guard = if let Some(ref telemetry) = ctx.telemetry {
        match telemetry.setup_telemetry(&ctx.log_level) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Failed to setup telemetry: {e}");
                setup_tracing(&ctx.log_level);
                None
            }
        }
    } else {
        setup_tracing(&ctx.log_level);
        None
    };

    let result = launch(ctx).await;

    // Flushes pending spans before the process exits.
    drop(telemetry_guard);

    result
}

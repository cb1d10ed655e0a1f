use chat_memory::{config::Config, telemetry, SharedState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let cfg = Config::from_env()?;
    cfg.print_config();

    let state = SharedState::from_config(cfg, Vec::new())?;
    state.start_background().await;
    let stats = state.database.get_stats()?;
    info!(
        "Memory service ready: {} sessions, {} messages, {} summaries",
        stats.total_sessions, stats.total_messages, stats.total_summaries
    );

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    state.shutdown().await;
    Ok(())
}

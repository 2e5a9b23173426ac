use anyhow::{Context, Result};
use killmail_formatter::{Config, LogFormat, SharedHealthState, init_logging, run_with_ctrl_c};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before reading LOG_FORMAT / RUST_LOG
    let dotenv = dotenvy::dotenv();

    init_logging(LogFormat::from_env());
    if let Ok(path) = dotenv {
        info!(event = "dotenv_loaded", path = %path.display(), "Loaded environment file");
    }

    let config = Config::from_env().context("Failed to load configuration")?;
    let health_state = SharedHealthState::default();

    run_with_ctrl_c(config, health_state).await
}

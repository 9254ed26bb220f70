//! Ledger server binary
//!
//! Hosts a ledger until Ctrl-C. Configuration comes from the TOML file named
//! by `LEDGER_CONFIG`, otherwise from `LEDGER_*` environment variables.
//! `LOG_FORMAT=json` switches to JSON logs.

use anyhow::Context;
use points_ledger::{Config, Ledger};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        Err(_) => Config::from_env().context("Invalid LEDGER_* environment"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting points ledger server");

    let config = load_config()?;
    let ledger = Ledger::open(config)
        .await
        .context("Failed to open ledger")?;

    let stats = ledger.reports().global_stats().await?;
    tracing::info!(
        backend = ledger.backend_name(),
        users = stats.total_users,
        votes = stats.total_votes,
        epoch = stats.tally_epoch,
        "Ledger opened successfully"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down ledger server");
    match ledger.metrics().render() {
        Ok(text) => println!("{}", text),
        Err(e) => tracing::warn!(error = %e, "Failed to render metrics"),
    }
    Ok(())
}

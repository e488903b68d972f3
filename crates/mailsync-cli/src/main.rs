use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

use cli::{Cli, output_error, run_cli};
use config::load_accounts_config;

const LOG_ENV: &str = "MAILSYNC_LOG";

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let accounts = match load_accounts_config() {
        Ok(accounts) => accounts,
        Err(err) => return output_error(&format!("{err:#}")),
    };
    if accounts.is_empty() {
        return output_error("No accounts configured");
    }
    let rt = tokio::runtime::Runtime::new()?;
    if let Err(err) = rt.block_on(run_cli(cli.command, &accounts)) {
        return output_error(&format!("{err:#}"));
    }
    Ok(())
}

// Logs go to stderr; stdout carries only the JSON result.
fn init_tracing() {
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

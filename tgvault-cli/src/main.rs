mod args;
mod commands;

use args::{Command, USAGE, parse_command};
use tgvault_engine::VaultConfig;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str =
    "tgvault_cli=info,tgvault_engine=info,tgvault_fuse=info,tgvault_core=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = parse_command(std::env::args())?;
    if command == Command::Help {
        print!("{USAGE}");
        return Ok(());
    }
    let config = VaultConfig::from_env()?;
    commands::run(command, &config).await
}

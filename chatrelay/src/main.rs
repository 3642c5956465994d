use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chatrelay::api::CompletionClient;
use chatrelay::config::AppConfig;
use chatrelay::logger::{self, RelayLogger};
use chatrelay::relay::Relay;
use chatrelay::tokenizer::TiktokenCounter;
use chatrelay::webhook::Notifier;
use chatrelay::{server, store};
use clap::Parser;
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:64133
    #[arg(long)]
    bind: Option<String>,

    /// Answer chat turns with a canned reply instead of calling the model API
    #[arg(long)]
    offline: bool,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = logger::parse_level(&cli.log_level).unwrap_or(LevelFilter::Info);
    let log_handle = RelayLogger::init(level).context("failed to install logger")?;

    let mut config = AppConfig::load(cli.config.as_deref(), cli.offline)?;
    if let Some(bind) = cli.bind {
        config.bind = bind
            .parse()
            .with_context(|| format!("invalid --bind address {bind:?}"))?;
    }
    if let Some(path) = &config.log_path {
        log_handle
            .attach_file(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
    }

    let counter = Arc::new(TiktokenCounter::load()?);
    let store = store::open_store(&config.database_url).await?;
    let client = CompletionClient::new(&config)?;
    let notifier = Notifier::new(config.hook_url.as_deref())?;
    let bind = config.bind;

    let relay = Relay::new(Arc::new(config), store, counter, client, notifier);
    server::serve(bind, Arc::new(relay)).await
}

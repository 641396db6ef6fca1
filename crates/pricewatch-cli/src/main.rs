use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pricewatch_adapters::SnapshotFetcher;
use pricewatch_core::PassOutcome;
use pricewatch_sync::SyncConfig;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pricewatch-cli")]
#[command(about = "Marketplace price watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one price check now
    Run,
    /// Run a price check now and then on every interval until ctrl-c
    Watch,
    /// Fetch one product page and print the snapshot
    Fetch { url: String },
    /// Print the tracked products
    List,
}

fn init_tracing(config: &SyncConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("parsing log filter")?;

    let error_file = match &config.error_log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening error log {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::ERROR),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(env_filter))
        .with(error_file)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env();
    init_tracing(&config)?;

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let engine = pricewatch_sync::build_engine(&config)?;
            let report = engine.run_pass().await;
            let r = report.result;
            println!(
                "price check finished: pass_id={} processed={} updated={} inserted={} failures={} notify_failures={}",
                report.pass_id, r.processed, r.updated, r.inserted, r.failures, r.notify_failures
            );
            if let PassOutcome::Aborted { reason } = report.outcome {
                bail!("price check aborted: {reason}");
            }
        }
        Commands::Watch => {
            pricewatch_sync::watch_until_ctrl_c(&config).await?;
        }
        Commands::Fetch { url } => {
            let fetcher = pricewatch_sync::build_fetcher(&config)?;
            let snapshot = fetcher
                .fetch(&url)
                .await
                .with_context(|| format!("fetching {url}"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot).context("serializing snapshot")?
            );
        }
        Commands::List => {
            let store = pricewatch_sync::open_store(&config);
            for record in store.records().await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    record.row, record.identifier, record.price, record.title, record.url
                );
            }
        }
    }

    Ok(())
}

//! Meter admin CLI - inspect and maintain a Meter data directory

mod args;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use metercache::{ArgSet, Clock, Fingerprint, MeterConfig, MeterContext, SystemClock};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory (overrides the config file)
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show cache and quota statistics
    Stats {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List usage per period, oldest first
    History,

    /// Zero the cache hit/miss counters and start a new epoch
    ResetStats,

    /// Remove expired cache entries
    Sweep,

    /// Remove every cache entry
    Clear,

    /// Remove cache entries older than a number of days
    ClearOld {
        /// Maximum entry age in days
        #[arg(long, default_value_t = 7)]
        max_age_days: i64,
    },

    /// Print the fingerprint of a request
    Fingerprint {
        /// Operation identifier
        operation: String,

        /// Arguments as name=value
        args: Vec<String>,
    },

    /// Check that a provider credential is available
    Credential,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let open = || -> Result<MeterContext> {
        let mut config = MeterConfig::load_or_default(args.config.as_deref())
            .context("failed to load configuration")?;
        if let Some(data) = &args.data {
            config.data_dir = data.clone();
        }

        info!("Data directory: {}", config.data_dir.display());
        let dir = config.data_dir.clone();
        MeterContext::open(config, clock.clone())
            .with_context(|| format!("failed to open data directory {}", dir.display()))
    };

    match &args.command {
        Command::Stats { json } => {
            let context = open()?;
            let snapshot = context.usage_stats();
            if *json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{}", snapshot);
                println!();
                println!("cached_entries:{}", context.cache().len()?);
            }
        }
        Command::History => {
            let context = open()?;
            for record in context.tracker().history()? {
                let last = record
                    .last_call_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t${:.2}\t{}",
                    record.period_key, record.call_count, record.total_cost, last
                );
                for (operation, count) in &record.calls_by_operation {
                    println!("  {}\t{}", operation, count);
                }
            }
        }
        Command::ResetStats => {
            open()?.reporter().reset_epoch()?;
            println!("Cache counters reset");
        }
        Command::Sweep => {
            let removed = open()?.cache().sweep(clock.now())?;
            println!("Removed {} expired entries", removed);
        }
        Command::Clear => {
            let removed = open()?.cache().clear()?;
            println!("Removed {} entries", removed);
        }
        Command::ClearOld { max_age_days } => {
            anyhow::ensure!(*max_age_days >= 0, "--max-age-days must not be negative");
            let max_age = Duration::try_days(*max_age_days)
                .context("--max-age-days is out of range")?;
            let removed = open()?.cache().clear_older_than(max_age)?;
            println!(
                "Removed {} entries older than {} days",
                removed, max_age_days
            );
        }
        Command::Fingerprint { operation, args } => print_fingerprint(operation, args)?,
        Command::Credential => {
            let context = open()?;
            context
                .credential()
                .context("no usable provider credential")?;
            println!("Credential found ({})", context.credential_sources());
        }
    }

    Ok(())
}

fn print_fingerprint(operation: &str, pairs: &[String]) -> Result<()> {
    let mut set = ArgSet::new();
    for pair in pairs {
        let (name, value) = args::parse_pair(pair)?;
        set.insert(name, value);
    }

    println!("{}", Fingerprint::compute(operation, &set));
    println!("{}", set.canonical());
    Ok(())
}

//! Command-line interface for the crawl engine.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::CrawlLog;
use crate::config::CrawlerConfig;
use crate::crawler::{CrawlOptions, Crawler};
use crate::profile::store::SqliteStore;

#[derive(Parser)]
#[command(
    name = "wraith",
    about = "Wraith — stealth web-crawling engine",
    version,
    after_help = "Run 'wraith <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Path to a JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a single URL through the stealth pipeline
    Fetch {
        url: String,
        /// Extraction selectors as KEY=CSS pairs (repeatable)
        #[arg(long = "select", value_name = "KEY=CSS")]
        selectors: Vec<String>,
        /// Stealth level override (low | medium | high | extreme)
        #[arg(long)]
        stealth: Option<String>,
        /// Fail immediately when the rate limiter has no slot
        #[arg(long)]
        no_wait: bool,
    },
    /// Crawl a list of URLs from a file, one per line
    Batch {
        file: PathBuf,
        /// Concurrent crawls (bounded by the configured maximum)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Deadline for the whole batch, in seconds
        #[arg(long)]
        deadline: Option<u64>,
    },
    /// Show profile pool statistics
    Pool,
    /// Generate shell completions
    Completions { shell: Shell },
}

/// Entry point for the `wraith` binary.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "wraith",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => CrawlerConfig::from_file(path)?,
        None => CrawlerConfig::default(),
    };

    let crawler = build_crawler(config)?;

    match cli.command {
        Commands::Fetch {
            url,
            selectors,
            stealth,
            no_wait,
        } => fetch(&crawler, &url, &selectors, stealth.as_deref(), no_wait, cli.json).await,
        Commands::Batch {
            file,
            concurrency,
            deadline,
        } => batch(&crawler, &file, concurrency, deadline, cli.json).await,
        Commands::Pool => {
            let stats = crawler.profiles().stats();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "profiles: {} total, {} active, {} banned",
                    stats.total, stats.active, stats.banned
                );
                println!(
                    "avg success rate: {:.2}  avg usage: {:.1}",
                    stats.avg_success_rate, stats.avg_usage_count
                );
            }
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    }
}

fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "wraith=debug" } else { "wraith=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_crawler(config: CrawlerConfig) -> Result<Crawler> {
    let log = CrawlLog::new();
    let crawler = Crawler::new(config, log);
    match SqliteStore::default_store() {
        Ok(store) => Ok(crawler.with_store(Arc::new(store))),
        Err(e) => {
            tracing::warn!(error = %e, "profile store unavailable, using in-memory pool");
            Ok(crawler)
        }
    }
}

async fn fetch(
    crawler: &Crawler,
    url: &str,
    raw_selectors: &[String],
    stealth: Option<&str>,
    no_wait: bool,
    json: bool,
) -> Result<()> {
    if let Some(level) = stealth {
        crawler.set_stealth_level(level.parse().map_err(anyhow::Error::msg)?);
    }

    let options = CrawlOptions {
        fail_fast_on_rate_limit: no_wait,
        ..Default::default()
    };
    let result = crawler.crawl(url, &options).await?;

    let selectors: Vec<(String, String)> = raw_selectors
        .iter()
        .map(|raw| {
            raw.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("selector must be KEY=CSS, got: {raw}"))
        })
        .collect::<Result<_>>()?;
    let extracted = crawler.extract(&result.body, &selectors);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "url": result.url,
                "final_url": result.final_url,
                "status": result.status,
                "bytes": result.bytes,
                "duration_ms": result.duration.as_millis() as u64,
                "attempts": result.attempts,
                "correlation_id": result.correlation_id,
                "detection": result.detection,
                "extracted": extracted,
            }))?
        );
    } else {
        println!(
            "{} -> {} ({} bytes, {} ms, {} attempt(s))",
            result.url,
            result.status,
            result.bytes,
            result.duration.as_millis(),
            result.attempts
        );
        if let Some(detection) = &result.detection {
            println!(
                "protection: {} (confidence {:.2})",
                detection.system.as_str(),
                detection.confidence
            );
        }
        if !extracted.is_empty() {
            println!("{}", serde_json::to_string_pretty(&extracted)?);
        }
    }
    Ok(())
}

async fn batch(
    crawler: &Crawler,
    file: &PathBuf,
    concurrency: Option<usize>,
    deadline: Option<u64>,
    json: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read url list: {}", file.display()))?;
    let urls: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect();

    let options = CrawlOptions {
        concurrency,
        deadline: deadline.map(Duration::from_secs),
        ..Default::default()
    };
    let report = crawler.crawl_batch(&urls, &options).await;

    if json {
        let items: Vec<_> = report
            .items
            .iter()
            .map(|item| {
                json!({
                    "url": item.url,
                    "correlation_id": item.correlation_id,
                    "ok": item.outcome.is_ok(),
                    "status": item.outcome.as_ref().ok().map(|r| r.status),
                    "error": item.outcome.as_ref().err().map(|e| e.to_string()),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "total": report.total,
                "successful": report.successful,
                "failed": report.failed,
                "items": items,
                "metrics": crawler.get_metrics(),
            }))?
        );
    } else {
        for item in &report.items {
            match &item.outcome {
                Ok(result) => println!("ok   {} ({})", item.url, result.status),
                Err(e) => println!("fail {} ({e})", item.url),
            }
        }
        println!(
            "{}/{} succeeded, {} failed",
            report.successful, report.total, report.failed
        );
    }
    Ok(())
}

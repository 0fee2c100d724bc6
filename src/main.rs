//! dsr-rs: operator CLI for the data subject rights engine
//!
//! The web layer calls the library directly; this binary covers the
//! operator side: the periodic deletion run, manual cancellation,
//! deadline monitoring and reporting.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

use dsr_rs::compliance::ComplianceEngine;
use dsr_rs::config::{EngineConfig, MAX_REQUEST_DEADLINE_DAYS};
use dsr_rs::logging::{init_logging, LogConfig};

#[derive(Parser)]
#[command(name = "dsr-rs")]
#[command(about = "Data subject rights request engine", version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "DSR_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL (overrides config file)
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Anonymize subjects whose scheduled deletion is due
    RunDeletions {
        /// Reference time (RFC 3339), defaults to now
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
    /// Cancel a scheduled deletion before it runs
    CancelDeletion {
        /// Subject identifier
        subject_id: String,
    },
    /// Dispatch requests left in the verified state
    Resume,
    /// Summarize requests received in the last N days
    Report {
        #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(i64).range(1..=MAX_REQUEST_DEADLINE_DAYS))]
        days: i64,
    },
    /// List open requests past their statutory deadline
    Overdue,
    /// Print a sample configuration file
    SampleConfig,
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_start(end: DateTime<Utc>, days: i64) -> anyhow::Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|window| end.checked_sub_signed(window))
        .with_context(|| format!("--days {} is out of range", days))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if let Command::SampleConfig = cli.command {
        print!("{}", EngineConfig::sample_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = EngineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let _guard = init_logging(&LogConfig::from_engine_config(&config))?;
    info!(database_url = %config.database_url, "starting dsr-rs");

    let engine = ComplianceEngine::from_config(&config)
        .await
        .context("failed to initialize compliance engine")?;

    match cli.command {
        Command::RunDeletions { now } => {
            let now = now.unwrap_or_else(Utc::now);
            let summary = engine.run_scheduled_deletions(now).await?;
            print_json(&summary)?;
            if summary.error_count > 0 {
                anyhow::bail!("{} deletion(s) failed", summary.error_count);
            }
        }
        Command::CancelDeletion { subject_id } => match engine.cancel_deletion(&subject_id).await? {
            Some(request) => print_json(&request)?,
            None => {
                eprintln!("No cancellable deletion for subject {}", subject_id);
                return Ok(ExitCode::from(2));
            }
        },
        Command::Resume => {
            let resumed = engine.resume_verified().await?;
            print_json(&resumed)?;
        }
        Command::Report { days } => {
            let end = Utc::now();
            let report = engine.report(report_start(end, days)?, end).await?;
            print_json(&report)?;
        }
        Command::Overdue => {
            let overdue = engine.overdue_requests(Utc::now()).await?;
            print_json(&overdue)?;
        }
        Command::SampleConfig => {}
    }

    Ok(ExitCode::SUCCESS)
}

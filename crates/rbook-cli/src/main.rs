use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rbook_core::RequestAction;
use rbook_reconcile::{describe_notice, ReconcileConfig, ReconcilePipeline, RunOptions};
use rbook_storage::{CsvFileSink, RecoveryOutcome, SheetSource};
use rbook_web::search::{export_sheet, search_roster, RecruiterColumns, SearchQuery};
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rbook-cli")]
#[command(about = "Resume book request reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending add/update/remove requests to the roster.
    Reconcile {
        /// Reconcile and write reports without touching the tables.
        #[arg(long)]
        dry_run: bool,
        /// Only process one kind of request (add, update, remove).
        #[arg(long)]
        only: Option<RequestAction>,
    },
    /// Pending request counts and recent activity.
    Status {
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Finish a write-back that was interrupted.
    Recover,
    /// Filter the roster and score resumes by keyword.
    Search {
        #[arg(long)]
        year_from: Option<i32>,
        #[arg(long)]
        year_to: Option<i32>,
        #[arg(long = "quarter")]
        quarters: Vec<String>,
        #[arg(long = "role")]
        roles: Vec<String>,
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        #[arg(long, default_value_t = 2)]
        min_matches: usize,
        /// Write matching rows to this CSV file.
        #[arg(long)]
        export: Option<PathBuf>,
    },
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
    {
        eprintln!("tracing init failed: {err}");
    }

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Status { today: None }) {
        Commands::Reconcile { dry_run, only } => {
            let pipeline = ReconcilePipeline::new(ReconcileConfig::from_env()?)?;
            let summary = pipeline.run_once(RunOptions { only, dry_run }).await?;
            let report = &summary.report;
            println!(
                "pending: add={} update={} remove={}",
                report.pending.add, report.pending.update, report.pending.remove
            );
            for stage in &report.stages {
                println!(
                    "{:<6} requests={} collapsed={} roster {} -> {} (+{} / -{})",
                    stage.action.label(),
                    stage.requests,
                    stage.deduplicated,
                    stage.roster_before,
                    stage.roster_after,
                    stage.appended,
                    stage.removed
                );
            }
            for notice in report.warnings() {
                println!("warning: {}", describe_notice(notice));
            }
            println!(
                "reconcile complete: run_id={} roster {} -> {} flagged_done={} persisted={} reports={}",
                report.run_id,
                report.roster_before,
                report.roster_after,
                report.flagged_done,
                summary.persisted,
                summary.reports_dir
            );
        }
        Commands::Status { today } => {
            let pipeline = ReconcilePipeline::new(ReconcileConfig::from_env()?)?;
            let status = pipeline
                .status(today.unwrap_or_else(|| Utc::now().date_naive()))
                .await?;
            println!(
                "pending: add={} update={} remove={} unknown={} (total {})",
                status.pending.add,
                status.pending.update,
                status.pending.remove,
                status.pending.unknown,
                status.pending.total()
            );
            println!(
                "requests={} roster_records={}",
                status.total_requests, status.roster_records
            );
            for (idx, week) in status.activity.weeks.iter().enumerate() {
                let days = week
                    .iter()
                    .map(|d| d.map_or_else(|| "-".to_string(), |n| n.to_string()))
                    .collect::<Vec<_>>();
                println!("week {}: {}", idx + 1, days.join(" "));
            }
            if let Some(run_id) = status.unfinished_commit {
                warn!(%run_id, "unfinished commit found; run `rbook-cli recover`");
            }
        }
        Commands::Recover => {
            let pipeline = ReconcilePipeline::new(ReconcileConfig::from_env()?)?;
            match pipeline.recover().await? {
                RecoveryOutcome::Clean => println!("nothing to recover"),
                RecoveryOutcome::RolledForward { run_id, files } => {
                    println!("recovered run_id={run_id} files={files}")
                }
            }
        }
        Commands::Search {
            year_from,
            year_to,
            quarters,
            roles,
            keywords,
            min_matches,
            export,
        } => {
            let config = ReconcileConfig::from_env()?;
            let (_, roster) = config.sources()?;
            let sheet = roster
                .read()
                .await
                .with_context(|| format!("loading roster from {}", roster.describe()))?;
            let query = SearchQuery {
                year_from,
                year_to,
                quarters,
                roles,
                keywords,
            };
            let columns = match &config.field_map {
                Some(path) => RecruiterColumns::from_field_map(path)?,
                None => RecruiterColumns::default(),
            };
            let results = search_roster(&sheet, &columns, &query)?;
            println!("matching requirements (ignoring keywords): {}", results.filtered);
            if results.exact_matches > 0 {
                println!("matching all keywords: {}", results.exact_matches);
            } else {
                println!("no resumes matched all keywords");
                println!("matching at least one keyword: {}", results.partial_matches);
                println!("most keywords matched in one resume: {}", results.max_match);
            }
            if let Some(path) = export {
                let out = export_sheet(&sheet, &results, min_matches);
                CsvFileSink::new(&path).write(&out).await?;
                println!("exported {} rows to {}", out.rows.len(), path.display());
            }
        }
        Commands::Serve => {
            rbook_web::serve_from_env().await?;
        }
    }

    Ok(())
}

//! patchtag-retag: recompute aggregated tags in bulk.
//!
//! Run after changing a project's tag set or the tag policy, or to repair
//! tag state after an outage. Ctrl-C stops the run between submissions and
//! prints the ids still pending.

use std::process::ExitCode;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use patchtag_db::{Database, PoolConfig};
use patchtag_jobs::{
    BulkConfig, BulkRecompute, ContributorMatching, PropagationPolicy, TagEngine, TagPolicy,
};

#[derive(Parser)]
#[command(name = "patchtag-retag")]
#[command(author, version, about = "Recompute aggregated review tags")]
struct Cli {
    /// Only recompute submissions of this project
    #[arg(short, long)]
    project: Option<i64>,

    /// Submission ids to recompute (default: all)
    ids: Vec<i64>,

    /// Submissions recomputed concurrently (overrides PATCHTAG_BULK_CONCURRENCY)
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Propagation policy (overrides PATCHTAG_PROPAGATION)
    #[arg(long)]
    propagation: Option<PropagationPolicy>,

    /// Contributor matching (overrides PATCHTAG_CONTRIBUTOR_MATCHING)
    #[arg(long)]
    contributor_matching: Option<ContributorMatching>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Skip applying pending migrations
    #[arg(long)]
    no_migrate: bool,

    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost/patchtag")]
    database_url: String,
}

/// Initialize tracing.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   RUST_LOG    - standard env filter (default: "patchtag_jobs=info,patchtag_db=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "patchtag_jobs=info,patchtag_db=info,patchtag_retag=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("patchtag-retag.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
        }
        Some(guard)
    } else {
        // Logs go to stderr; stdout carries the report.
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        None
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let db = Database::connect_with_config(&cli.database_url, PoolConfig::from_env()).await?;
    if !cli.no_migrate {
        db.migrate().await?;
    }

    let mut policy = TagPolicy::from_env()?;
    if let Some(propagation) = cli.propagation {
        policy = policy.with_propagation(propagation);
    }
    if let Some(matching) = cli.contributor_matching {
        policy = policy.with_contributor_matching(matching);
    }

    let mut config = BulkConfig::from_env()?;
    if let Some(n) = cli.concurrency {
        config = config.with_concurrency(n);
    }

    info!(
        propagation = %policy.propagation,
        contributor_matching = %policy.contributor_matching,
        concurrency = config.concurrency,
        "Starting retag"
    );

    let engine = TagEngine::from_database(&db, policy);
    let bulk = BulkRecompute::new(engine, config).with_progress(|p| {
        eprintln!("{}/{} ({}%), {} failed", p.processed, p.total, p.percent(), p.failed);
    });

    let cancel = bulk.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight submissions");
            cancel.cancel();
        }
    });

    let ids = (!cli.ids.is_empty()).then_some(cli.ids);
    let report = bulk.run(cli.project, ids).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Run:        {}", report.run_id);
        println!("Total:      {}", report.total);
        println!("Succeeded:  {}", report.succeeded);
        println!("Rows changed: {}", report.changed);
        for failure in &report.failed {
            println!("Failed:     {} ({})", failure.submission_id, failure.error);
        }
        if report.cancelled {
            println!("Cancelled with {} pending", report.pending.len());
        }
        let resume_ids = report.resume_ids();
        if !resume_ids.is_empty() {
            println!("Resume with: {}", resume_command(cli.project, &resume_ids));
        }
        println!("Duration:   {}ms", report.duration_ms);
    }

    Ok(report.failed.is_empty() && !report.cancelled)
}

/// Command line that retries failed and unprocessed submissions.
fn resume_command(project: Option<i64>, ids: &[i64]) -> String {
    let mut args = vec!["patchtag-retag".to_string()];
    if let Some(project) = project {
        args.push(format!("--project {}", project));
    }
    args.extend(ids.iter().map(|id| id.to_string()));
    args.join(" ")
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let _file_guard = init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_command_keeps_project_scope() {
        assert_eq!(
            resume_command(Some(3), &[4, 9]),
            "patchtag-retag --project 3 4 9"
        );
        assert_eq!(resume_command(None, &[12]), "patchtag-retag 12");
    }

    #[test]
    fn test_cli_parses_project_and_ids() {
        let cli = Cli::parse_from(["patchtag-retag", "--project", "3", "4", "9"]);
        assert_eq!(cli.project, Some(3));
        assert_eq!(cli.ids, vec![4, 9]);
    }
}

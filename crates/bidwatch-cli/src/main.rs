use anyhow::{Context, Result};
use bidwatch_sync::{BidwatchConfig, JobReport, JobRunner};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bidwatch")]
#[command(about = "Procurement bidding collector, change notifier and dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the collection job for one or more task keys, in order.
    Run {
        #[arg(required = true, value_name = "TASK_KEY")]
        keys: Vec<String>,
    },
    /// Run every registered query.
    RunAll,
    /// List registered queries.
    Queries,
    /// Serve the dashboard.
    Serve,
}

/// Text output by default, JSON lines when `RUST_LOG_FORMAT=json`.
fn init_tracing() {
    let use_json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(Level::INFO.into())
            .from_env_lossy()
    };

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().flatten_event(true).with_current_span(true))
            .with(filter())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter())
            .init();
    }
}

fn print_report(report: &JobReport) {
    let diff = report
        .diff
        .map(|d| format!("+{} -{}", d.added, d.removed))
        .unwrap_or_else(|| "n/a".to_string());
    println!(
        "job {} ({}): status={:?} run_id={} records={} pages={} diff={} errors={}",
        report.query_key,
        report.query_name,
        report.status,
        report.run_id,
        report.records,
        report.pages_requested,
        diff,
        report.errors.len()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = BidwatchConfig::from_env();

    match cli.command.unwrap_or(Commands::RunAll) {
        Commands::Run { keys } => {
            let registry = config.load_registry().context("loading query registry")?;
            let runner = JobRunner::from_config(&config, registry)?;
            for report in runner.run_keys(&keys).await? {
                print_report(&report);
            }
        }
        Commands::RunAll => {
            let registry = config.load_registry().context("loading query registry")?;
            let runner = JobRunner::from_config(&config, registry)?;
            for report in runner.run_all().await {
                print_report(&report);
            }
        }
        Commands::Queries => {
            let registry = config.load_registry().context("loading query registry")?;
            for query in &registry.queries {
                let filters = query
                    .filters
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",");
                let monitored = query
                    .diff
                    .as_ref()
                    .map(|d| format!("diff -> {}", d.state_path))
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{}",
                    query.key,
                    query.name,
                    filters,
                    monitored
                );
            }
        }
        Commands::Serve => {
            bidwatch_web::serve_from_env().await?;
        }
    }

    Ok(())
}

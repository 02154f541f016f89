//! CLI for the blockchain transaction analytics pipeline.

use chainwatch_analytics::config::AnalyticsConfig;
use chainwatch_analytics::metrics::AnalyticsMetrics;
use chainwatch_analytics::model::Window;
use chainwatch_analytics::pipeline::{PipelineOrchestrator, RunContext, RunIdentity};
use chainwatch_analytics::storage::StorageGateway;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "analytics-cli")]
#[command(about = "CLI for the blockchain transaction analytics pipeline")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Remote fallback URL for the config, if the local file is missing or unparsable.
    #[arg(long, global = true)]
    config_fallback_url: Option<String>,

    /// SQLite database URL.
    #[arg(long, default_value = "sqlite://analytics.db", global = true)]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for one network/window/processing-date partition.
    Run {
        /// Network to analyze (e.g. ethereum).
        #[arg(short, long)]
        network: String,

        /// Window start, in epoch milliseconds.
        #[arg(long)]
        t0: i64,

        /// Window end, in epoch milliseconds.
        #[arg(long)]
        t1: i64,

        /// Partition date (YYYY-MM-DD) the run's output is filed under.
        #[arg(short, long)]
        processing_date: String,

        /// Per-stage timeout in seconds.
        #[arg(long, default_value = "300")]
        stage_timeout_secs: u64,

        /// Port to expose the Prometheus metrics pull endpoint on while the run executes.
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Idempotently (re)initialize the analyzer schema without running a pipeline.
    Migrate,

    /// Print the audit rows recorded for a partition.
    ShowAudit {
        #[arg(short, long)]
        network: String,

        #[arg(long)]
        window_days: i64,

        #[arg(short, long)]
        processing_date: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    chainwatch_analytics::utils::logging::init_logging();

    let cli = Cli::parse();
    let config = Arc::new(AnalyticsConfig::load(&cli.config, cli.config_fallback_url.as_deref()).await?);
    let storage = Arc::new(StorageGateway::connect(&cli.database_url).await?);

    match cli.command {
        Commands::Run { network, t0, t1, processing_date, stage_timeout_secs, metrics_port } => {
            let metrics = Arc::new(AnalyticsMetrics::new().map_err(|e| e.to_string())?);
            if let Some(port) = metrics_port {
                let serving = metrics.clone();
                tokio::spawn(async move { serving.serve(port).await });
            }

            let orchestrator = PipelineOrchestrator::new(storage, config)
                .with_stage_timeout(std::time::Duration::from_secs(stage_timeout_secs))
                .with_metrics(metrics);

            let identity = RunIdentity { network, window: Window::new(t0, t1)?, processing_date };
            let ctx = RunContext::new(identity);

            println!("running pipeline for {} [{t0}, {t1})...", ctx.identity.network);
            let summary = orchestrator.run(&ctx).await?;

            println!("run complete:");
            println!("  flows built:    {}", summary.flows_built);
            println!("  features built: {}", summary.features_built);
            println!("  patterns found: {}", summary.patterns_found);
            println!("  alerts found:   {}", summary.alerts_found);
            println!("  clusters found: {}", summary.clusters_found);
            println!("  duration:       {:.2}s", summary.duration_s);
        }

        Commands::Migrate => {
            storage.init_schema().await?;
            println!("schema initialized at {}", cli.database_url);
        }

        Commands::ShowAudit { network, window_days, processing_date } => {
            let rows = storage.get_audit_for_partition(&network, window_days, &processing_date).await?;
            if rows.is_empty() {
                println!("no audit rows for {network}/{window_days}d/{processing_date}");
            }
            for row in rows {
                println!(
                    "{} {}d {} started={} ended={} duration={:.2}s",
                    row.network, row.window_days, row.processing_date, row.started_at, row.ended_at, row.duration_s
                );
            }
        }
    }

    Ok(())
}

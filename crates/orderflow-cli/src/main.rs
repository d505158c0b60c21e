use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use orderflow_sync::{maybe_build_scheduler, report_recent_runs, SqlStores, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "orderflow")]
#[command(version, about = "Online order batch ETL: download, stage, clean and upsert")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one batch
    Run(RunArgs),
    /// Run batches on the configured cron schedule until interrupted
    Schedule,
    /// Create the staging and destination tables if absent
    Migrate,
    /// Summarize the most recent runs
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Args, Default)]
struct RunArgs {
    /// Use this local file instead of downloading the dataset
    #[arg(long)]
    file: Option<PathBuf>,
    /// Stage and upsert into in-memory stores only
    #[arg(long)]
    dry_run: bool,
    /// Retry a failed stage per ORDERFLOW_RETRIES / ORDERFLOW_RETRY_DELAY_SECS
    #[arg(long)]
    retry: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("ORDERFLOW_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let pipeline = if args.dry_run {
                SyncPipeline::dry_run(config)?
            } else {
                SyncPipeline::new(config)?
            };
            let summary = match (&args.file, args.retry) {
                (file, true) => pipeline.run_with_retry(file.as_deref()).await?,
                (Some(file), false) => pipeline.run_file(file).await?,
                (None, false) => pipeline.run_once().await?,
            };
            println!(
                "sync complete: run_id={} extracted={} staged={} cleaned={} inserted={} skipped={} reports={}",
                summary.run_id,
                summary.extracted_rows,
                summary.staged.appended,
                summary.transform.output_rows,
                summary.upsert.inserted,
                summary.upsert.skipped,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let mut sched = maybe_build_scheduler(pipeline)
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            SqlStores::from_config(&config).migrate().await?;
            info!("store tables ready");
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(&config.reports_root(), runs)?);
        }
    }

    Ok(())
}

//! Cadence CLI

use anyhow::{bail, Result};
use cadence_core::providers::mock::mock_registry;
use cadence_core::{
    Database, IntervalTickSource, PollerConfig, ReleaseService, Scheduler, SchedulerConfig,
    TaskStage, TickSource, WorkflowPoller,
};
use clap::{Parser, Subcommand};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Initialize logging with the specified verbosity level
fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter =
        EnvFilter::from_default_env().add_directive(format!("cadence={}", level).parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 1)
        .with_file(verbose >= 2)
        .with_line_number(verbose >= 2);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Release orchestration daemon and operator commands")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database path
    #[arg(long, env = "CADENCE_DB_PATH", default_value = "cadence.db")]
    db_path: String,

    /// Directory manual build uploads are stored under
    #[arg(long, env = "CADENCE_UPLOADS_DIR", default_value = "uploads")]
    uploads_dir: String,

    /// Increase verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output logs as JSON (for machine parsing)
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Daemon management
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Release management
    Release {
        #[command(subcommand)]
        action: ReleaseAction,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Run the scheduler and workflow poller until interrupted
    Start {
        /// Tick interval in seconds
        #[arg(long, env = "CADENCE_TICK_INTERVAL", default_value = "60")]
        tick_interval: u64,

        /// Maximum releases orchestrated concurrently per tick
        #[arg(long, env = "CADENCE_MAX_CONCURRENCY", default_value = "8")]
        max_concurrency: usize,

        /// Use the in-memory provider bundle instead of real integrations
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ReleaseAction {
    /// Start orchestration for a release
    Start {
        release_id: String,
        #[arg(long, default_value = "cli")]
        account: String,
    },
    /// Pause a running release
    Pause {
        release_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "cli")]
        account: String,
    },
    /// Resume a user-paused release
    Resume {
        release_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "cli")]
        account: String,
    },
    /// Archive a release
    Archive {
        release_id: String,
        #[arg(long, default_value = "cli")]
        account: String,
    },
    /// Manually trigger stage 2 or 3
    TriggerStage {
        release_id: String,
        /// Stage number (2 or 3)
        stage: u8,
        #[arg(long, default_value = "cli")]
        account: String,
    },
    /// Show per-platform manual upload readiness for a stage
    Uploads {
        release_id: String,
        /// KICKOFF, REGRESSION or POST_REGRESSION
        stage: String,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Reset a failed task for the next tick
    Retry {
        task_id: String,
        #[arg(long, default_value = "cli")]
        account: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_json)?;

    let db = Database::new(&cli.db_path).await?;
    let service = ReleaseService::new(db.clone(), &cli.uploads_dir);

    match cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Start {
                tick_interval,
                max_concurrency,
                dry_run,
            } => {
                if !dry_run {
                    bail!(
                        "no provider bundle is wired in this build; run with --dry-run \
                         or deploy with a composition root that supplies real providers"
                    );
                }
                let (providers, _state) = mock_registry();

                let config = SchedulerConfig {
                    tick_interval_secs: tick_interval,
                    max_concurrency,
                    ..Default::default()
                };
                info!(
                    db_path = %cli.db_path,
                    instance_id = %config.instance_id,
                    "Starting cadence daemon"
                );

                let scheduler = Arc::new(Scheduler::new(db.clone(), providers.clone(), config));
                let poller =
                    WorkflowPoller::new(db.clone(), providers, PollerConfig::default());

                let tick_source = Arc::new(IntervalTickSource::new());
                let (poll_shutdown_tx, poll_shutdown_rx) = tokio::sync::watch::channel(false);

                let poller_handle = tokio::spawn(async move { poller.run(poll_shutdown_rx).await });

                let source = tick_source.clone();
                let scheduler_handle =
                    tokio::spawn(async move { source.start(scheduler).await });

                tokio::signal::ctrl_c().await?;
                info!("Shutdown signal received");
                tick_source.stop();
                let _ = poll_shutdown_tx.send(true);
                let _ = scheduler_handle.await;
                let _ = poller_handle.await;
            }
        },
        Commands::Release { action } => match action {
            ReleaseAction::Start {
                release_id,
                account,
            } => {
                service.start(&release_id, &account).await?;
                println!("Release {} started", release_id);
            }
            ReleaseAction::Pause {
                release_id,
                tenant,
                account,
            } => {
                let outcome = service.pause(&release_id, &tenant, &account).await?;
                if outcome.already_paused {
                    println!("Release {} was already paused", release_id);
                } else {
                    println!("Release {} paused", release_id);
                }
            }
            ReleaseAction::Resume {
                release_id,
                tenant,
                account,
            } => {
                service.resume(&release_id, &tenant, &account).await?;
                println!("Release {} resumed", release_id);
            }
            ReleaseAction::Archive {
                release_id,
                account,
            } => {
                service.archive(&release_id, &account).await?;
                println!("Release {} archived", release_id);
            }
            ReleaseAction::TriggerStage {
                release_id,
                stage,
                account,
            } => {
                match stage {
                    2 => service.trigger_stage2(&release_id, &account).await?,
                    3 => service.trigger_stage3(&release_id, &account).await?,
                    other => bail!("stage must be 2 or 3, got {}", other),
                }
                println!("Stage {} triggered for release {}", stage, release_id);
            }
            ReleaseAction::Uploads { release_id, stage } => {
                let stage = TaskStage::from_str(&stage)?;
                let summary = service.upload_summary(&release_id, stage).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        },
        Commands::Task { action } => match action {
            TaskAction::Retry { task_id, account } => {
                service.retry_task(&task_id, &account).await?;
                println!("Task {} reset; the next tick picks it up", task_id);
            }
        },
    }

    Ok(())
}

//! Backup daemon - Main entry point
//!
//! `run` keeps the cron driver alive until SIGINT/SIGTERM; every other
//! command performs one operation and prints its JSON response.

mod scheduler;
mod shutdown;

use anyhow::Result;
use backup_core::api::{CleanupParams, VerifyParams};
use backup_core::catalog::CatalogQuery;
use backup_core::executor::BackupRequest;
use backup_core::models::{BackupKind, CreateScheduleRequest, ScheduleFilter};
use backup_core::restore::RestoreRequest;
use backup_core::retention::RetentionPolicy;
use backup_core::status::StatusRequest;
use backup_core::{utils, Config, DrService, Response};
use clap::{Parser, Subcommand};
use scheduler::CronDriver;
use serde::Serialize;
use shutdown::ShutdownCoordinator;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backup root directory (overrides config)
    #[arg(long, value_name = "DIR")]
    backup_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scheduled backups until interrupted
    Run,
    /// Create a backup now
    Backup {
        #[arg(required = true)]
        sources: Vec<String>,
        /// Capture everything instead of linking unchanged files
        #[arg(long)]
        full: bool,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        no_compression: bool,
        #[arg(long)]
        level: Option<i32>,
        /// Quick-verify right after creation
        #[arg(long)]
        verify: bool,
        #[arg(long = "exclude", value_name = "GLOB")]
        exclude_patterns: Vec<String>,
    },
    /// List catalogued backups, newest first
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Verify a backup's manifest and data
    Verify {
        backup_id: String,
        /// Check sizes only instead of re-hashing content
        #[arg(long)]
        quick: bool,
    },
    /// Restore a backup
    Restore {
        backup_id: String,
        /// Restore under this directory instead of the original locations
        #[arg(long)]
        destination: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
        /// Safety snapshot before overwriting (default: same as --overwrite)
        #[arg(long)]
        pre_backup: Option<bool>,
        #[arg(long)]
        dry_run: bool,
        /// Restore only these paths
        #[arg(long = "only", value_name = "PATH")]
        selective: Vec<String>,
    },
    /// Apply the retention policy (dry run unless --execute)
    Cleanup {
        #[arg(long)]
        execute: bool,
        #[arg(long)]
        daily: Option<u32>,
        #[arg(long)]
        weekly: Option<u32>,
        #[arg(long)]
        monthly: Option<u32>,
    },
    /// Catalog statistics and health
    Status {
        #[arg(long)]
        schedules: bool,
        #[arg(long)]
        retention: bool,
    },
    /// Delete one backup
    Delete { backup_id: String },
    /// Manage recurring backups
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    Create {
        id: String,
        /// Cron expression, e.g. "0 2 * * *"
        #[arg(long)]
        cron: String,
        #[arg(required = true)]
        sources: Vec<String>,
        #[arg(long)]
        full: bool,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        no_compression: bool,
        #[arg(long)]
        verify: bool,
        #[arg(long = "exclude", value_name = "GLOB")]
        exclude_patterns: Vec<String>,
        #[arg(long)]
        disabled: bool,
    },
    List {
        #[arg(long)]
        enabled: Option<bool>,
    },
    Get { id: String },
    Enable { id: String },
    Disable { id: String },
    Delete { id: String },
    /// Run a schedule now
    Trigger { id: String },
}

fn kind(full: bool) -> BackupKind {
    if full {
        BackupKind::Full
    } else {
        BackupKind::Incremental
    }
}

fn emit<T: Serialize>(response: Response<T>) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(if response.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    if let Some(dir) = args.backup_dir {
        config.storage.backup_dir = dir;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let service = DrService::new(config)?;

    match args.command {
        Command::Run => run(service).await,
        Command::Backup {
            sources,
            full,
            label,
            no_compression,
            level,
            verify,
            exclude_patterns,
        } => emit(
            service
                .create_backup(BackupRequest {
                    sources,
                    kind: kind(full),
                    label,
                    compression: Some(!no_compression),
                    compression_level: level,
                    verify: verify.then_some(true),
                    exclude_patterns,
                })
                .await,
        ),
        Command::List { limit } => emit(
            service
                .list_backups(CatalogQuery {
                    limit,
                    ..CatalogQuery::default()
                })
                .await,
        ),
        Command::Verify { backup_id, quick } => emit(
            service
                .verify_backup(VerifyParams {
                    backup_id,
                    quick: Some(quick),
                })
                .await,
        ),
        Command::Restore {
            backup_id,
            destination,
            overwrite,
            pre_backup,
            dry_run,
            selective,
        } => emit(
            service
                .restore_backup(RestoreRequest {
                    backup_id,
                    destination,
                    overwrite,
                    pre_backup,
                    dry_run,
                    selective,
                })
                .await,
        ),
        Command::Cleanup {
            execute,
            daily,
            weekly,
            monthly,
        } => {
            let configured = service.config().retention;
            let policy = RetentionPolicy {
                daily: daily.unwrap_or(configured.daily),
                weekly: weekly.unwrap_or(configured.weekly),
                monthly: monthly.unwrap_or(configured.monthly),
            };
            emit(
                service
                    .cleanup_old_backups(CleanupParams {
                        dry_run: Some(!execute),
                        retention_policy: Some(policy),
                    })
                    .await,
            )
        }
        Command::Status {
            schedules,
            retention,
        } => emit(
            service
                .get_backup_status(StatusRequest {
                    include_schedules: schedules,
                    include_retention: retention,
                    recent_limit: None,
                })
                .await,
        ),
        Command::Delete { backup_id } => emit(service.delete_backup(backup_id).await),
        Command::Schedule { command } => schedule_command(&service, command).await,
    }
}

async fn schedule_command(service: &DrService, command: ScheduleCommand) -> Result<ExitCode> {
    match command {
        ScheduleCommand::Create {
            id,
            cron,
            sources,
            full,
            label,
            no_compression,
            verify,
            exclude_patterns,
            disabled,
        } => emit(
            service
                .create_schedule(CreateScheduleRequest {
                    id,
                    cron,
                    sources,
                    kind: kind(full),
                    label,
                    compression: !no_compression,
                    verify,
                    exclude_patterns,
                    enabled: !disabled,
                })
                .await,
        ),
        ScheduleCommand::List { enabled } => emit(
            service
                .list_schedules(ScheduleFilter {
                    enabled,
                    source: None,
                })
                .await,
        ),
        ScheduleCommand::Get { id } => emit(service.get_schedule(id).await),
        ScheduleCommand::Enable { id } => emit(service.enable_schedule(id).await),
        ScheduleCommand::Disable { id } => emit(service.disable_schedule(id).await),
        ScheduleCommand::Delete { id } => emit(service.delete_schedule(id).await),
        ScheduleCommand::Trigger { id } => emit(service.trigger_schedule(id).await),
    }
}

async fn run(service: DrService) -> Result<ExitCode> {
    tracing::info!(
        "Starting backup-daemon v{} (backup_dir: {})",
        env!("CARGO_PKG_VERSION"),
        service.config().storage.backup_dir.display()
    );

    let interval = Duration::from_secs(service.config().scheduler.sync_interval_secs.max(1));
    let shutdown = ShutdownCoordinator::new();
    let driver = CronDriver::new(service.schedules().clone()).await?;

    let cancel = shutdown.token();
    let driver_handle = tokio::spawn(async move { driver.run(interval, cancel).await });

    // Wait for shutdown signal
    shutdown.wait_for_signal().await;

    match tokio::time::timeout(Duration::from_secs(10), driver_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Scheduler stopped"),
        Ok(Ok(Err(e))) => tracing::error!("Scheduler error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Scheduler task panicked: {}", e),
        Err(_) => tracing::warn!("Scheduler shutdown timeout, forcing exit"),
    }

    Ok(ExitCode::SUCCESS)
}

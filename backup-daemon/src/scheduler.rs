//! Cron driver: turns the registry's active triggers into scheduler jobs.
//!
//! The schedules file stays the source of truth. Every `sync_interval_secs`
//! the driver reloads it (the CLI edits it from another process) and adds,
//! replaces or removes jobs so that exactly the enabled schedules fire. A
//! fire only calls `ScheduleRegistry::on_fire`; overlapping fires are
//! rejected there. An expression the scheduler refuses is noted on the
//! schedule's `last_error`.

use backup_core::schedule::{normalize_cron, ScheduleRegistry};
use backup_core::DrError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct RegisteredJob {
    cron: String,
    job_id: Uuid,
}

pub struct CronDriver {
    scheduler: Mutex<JobScheduler>,
    registry: Arc<ScheduleRegistry>,
    jobs: Mutex<HashMap<String, RegisteredJob>>,
    /// Expressions already reported as unschedulable, by schedule id
    rejected: Mutex<HashMap<String, String>>,
}

impl CronDriver {
    pub async fn new(registry: Arc<ScheduleRegistry>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            registry,
            jobs: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashMap::new()),
        })
    }

    async fn schedule_job(&self, schedule_id: &str, cron: &str) -> anyhow::Result<Uuid> {
        let registry = self.registry.clone();
        let sid = schedule_id.to_string();

        let job = Job::new_async(normalize_cron(cron).as_str(), move |_uuid, _lock| {
            let registry = registry.clone();
            let sid = sid.clone();
            Box::pin(async move {
                let id = sid.clone();
                let result = tokio::task::spawn_blocking(move || registry.on_fire(&id)).await;
                match result {
                    Ok(Ok(Some(run))) => tracing::info!(
                        schedule_id = %sid,
                        backup_id = %run.outcome.backup_id,
                        status = ?run.outcome.metadata.status,
                        "Scheduled backup finished"
                    ),
                    Ok(Ok(None)) => {}
                    Ok(Err(DrError::Busy(_))) => {
                        tracing::warn!(schedule_id = %sid, "Skipping scheduled run: schedule already running")
                    }
                    Ok(Err(e)) => tracing::error!(schedule_id = %sid, error = %e, "Scheduled backup failed"),
                    Err(e) => tracing::error!(schedule_id = %sid, error = %e, "Scheduled backup task panicked"),
                }
            })
        })?;

        let job_id = self.scheduler.lock().await.add(job).await?;
        tracing::info!(schedule_id = %schedule_id, cron = %cron, "Job scheduled");
        Ok(job_id)
    }

    /// Bring scheduler jobs in line with the registry. Returns the number of
    /// registered jobs afterwards.
    pub async fn sync(&self) -> usize {
        let registry = self.registry.clone();
        match tokio::task::spawn_blocking(move || registry.load_active()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to reload schedules, keeping current jobs"),
            Err(e) => tracing::error!(error = %e, "Schedule reload task panicked"),
        }

        let wanted: HashMap<String, String> = self
            .registry
            .active_triggers()
            .into_iter()
            .map(|(id, trigger)| (id, trigger.cron))
            .collect();

        let mut jobs = self.jobs.lock().await;

        let stale: Vec<String> = jobs
            .iter()
            .filter(|(id, job)| wanted.get(*id) != Some(&job.cron))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(job) = jobs.remove(&id) {
                if let Err(e) = self.scheduler.lock().await.remove(&job.job_id).await {
                    tracing::warn!(schedule_id = %id, error = %e, "Failed to remove job");
                }
                tracing::info!(schedule_id = %id, "Job unscheduled");
            }
        }

        let mut rejected = self.rejected.lock().await;
        rejected.retain(|id, cron| wanted.get(id) == Some(&*cron));

        for (id, cron) in wanted {
            if jobs.contains_key(&id) || rejected.get(&id) == Some(&cron) {
                continue;
            }
            match self.schedule_job(&id, &cron).await {
                Ok(job_id) => {
                    jobs.insert(id, RegisteredJob { cron, job_id });
                }
                Err(e) => {
                    tracing::error!(schedule_id = %id, cron = %cron, error = %e, "Failed to schedule job");
                    let message = format!("scheduler rejected cron '{cron}': {e}");
                    let registry = self.registry.clone();
                    let sid = id.clone();
                    let recorded =
                        tokio::task::spawn_blocking(move || registry.record_trigger_error(&sid, &message)).await;
                    if !matches!(recorded, Ok(Ok(()))) {
                        tracing::warn!(schedule_id = %id, "Could not record trigger error on schedule");
                    }
                    rejected.insert(id, cron);
                }
            }
        }

        jobs.len()
    }

    /// Start firing and keep jobs synced until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) -> anyhow::Result<()> {
        let count = self.sync().await;
        tracing::info!(count, "Cron schedules initialized");
        self.scheduler.lock().await.start().await?;

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let count = self.sync().await;
                    tracing::debug!(count, "Schedules re-synced");
                }
            }
        }

        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

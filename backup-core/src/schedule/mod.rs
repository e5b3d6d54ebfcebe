//! Recurring backup schedules.
//!
//! Definitions are persisted in `schedules.json` (rewritten atomically on
//! every change). Enabled schedules are mirrored into an in-memory map of
//! active triggers that the cron driver reads; the driver calls
//! [`ScheduleRegistry::on_fire`] and never touches definitions itself.

pub mod tracker;
pub mod trigger;

use crate::executor::{BackupOutcome, BackupPipeline, BackupRequest};
use crate::fs::walker::build_globset;
use crate::models::{
    BackupStatus, CreateScheduleRequest, ScheduleDefinition, ScheduleFilter, UpdateScheduleRequest,
};
use crate::store::atomic_write;
use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

pub use tracker::RunTracker;
pub use trigger::{normalize_cron, CronTriggerSource, TriggerSource};

const SCHEDULES_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SchedulesFile {
    version: u32,
    #[serde(default)]
    schedules: Vec<ScheduleDefinition>,
}

/// What the cron driver needs to know about one enabled schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTrigger {
    pub cron: String,
    pub next_run: Option<DateTime<Utc>>,
}

/// Result of one schedule execution.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRun {
    pub schedule: ScheduleDefinition,
    pub outcome: BackupOutcome,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduleSummary {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub running: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_schedule_id: Option<String>,
}

pub struct ScheduleRegistry {
    path: PathBuf,
    pipeline: Arc<BackupPipeline>,
    triggers: Arc<dyn TriggerSource>,
    active: DashMap<String, ActiveTrigger>,
    tracker: RunTracker,
    write_lock: Mutex<()>,
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(DrError::InvalidArguments("schedule id is required".into()));
    }
    if id.contains(['/', '\\']) {
        return Err(DrError::InvalidArguments(format!("invalid schedule id '{id}'")));
    }
    Ok(())
}

fn validate_sources(sources: &[String]) -> Result<()> {
    if sources.is_empty() || sources.iter().any(|s| s.trim().is_empty()) {
        return Err(DrError::InvalidArguments(
            "a schedule needs at least one non-blank source".into(),
        ));
    }
    Ok(())
}

impl ScheduleRegistry {
    pub fn new(path: impl Into<PathBuf>, pipeline: Arc<BackupPipeline>, triggers: Arc<dyn TriggerSource>) -> Self {
        Self {
            path: path.into(),
            pipeline,
            triggers,
            active: DashMap::new(),
            tracker: RunTracker::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild the active trigger map from disk. Returns how many are active.
    ///
    /// Other processes (the CLI) edit the same file, so long-running callers
    /// reload periodically. Entries are replaced in place, never cleared first.
    pub fn load_active(&self) -> Result<usize> {
        let now = Utc::now();
        let mut fresh: HashMap<String, ActiveTrigger> = HashMap::new();
        for schedule in self.load()?.into_iter().filter(|s| s.enabled) {
            let next_run = match schedule.next_run {
                Some(at) if at > now => Some(at),
                _ => self.next_run(&schedule.cron, now),
            };
            fresh.insert(
                schedule.id,
                ActiveTrigger {
                    cron: schedule.cron,
                    next_run,
                },
            );
        }

        self.active.retain(|id, _| fresh.contains_key(id));
        for (id, trigger) in fresh {
            self.active.insert(id, trigger);
        }
        debug!(active = self.active.len(), "Loaded schedules");
        Ok(self.active.len())
    }

    pub fn create(&self, request: CreateScheduleRequest) -> Result<ScheduleDefinition> {
        validate_id(&request.id)?;
        validate_sources(&request.sources)?;
        self.triggers.validate(&request.cron)?;
        build_globset(&request.exclude_patterns)?;

        let now = Utc::now();
        let schedule = ScheduleDefinition {
            next_run: if request.enabled {
                self.next_run(&request.cron, now)
            } else {
                None
            },
            id: request.id,
            cron: request.cron,
            sources: request.sources,
            kind: request.kind,
            label: request.label,
            compression: request.compression,
            verify: request.verify,
            exclude_patterns: request.exclude_patterns,
            enabled: request.enabled,
            last_run: None,
            created_at: now,
            updated_at: now,
            last_status: None,
            last_backup_id: None,
            last_error: None,
            run_count: 0,
        };

        let created = self.mutate(|schedules| {
            if schedules.iter().any(|s| s.id == schedule.id) {
                return Err(DrError::InvalidArguments(format!(
                    "schedule '{}' already exists",
                    schedule.id
                )));
            }
            schedules.push(schedule.clone());
            Ok(schedule)
        })?;

        self.sync_active(&created);
        info!(schedule_id = %created.id, cron = %created.cron, enabled = created.enabled, "Schedule created");
        Ok(created)
    }

    pub fn list(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleDefinition>> {
        let mut schedules: Vec<_> = self.load()?.into_iter().filter(|s| filter.matches(s)).collect();
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(schedules)
    }

    pub fn get(&self, id: &str) -> Result<ScheduleDefinition> {
        self.load()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| DrError::NotFound(format!("schedule '{id}'")))
    }

    pub fn update(&self, id: &str, request: UpdateScheduleRequest) -> Result<ScheduleDefinition> {
        if let Some(cron) = &request.cron {
            self.triggers.validate(cron)?;
        }
        if let Some(sources) = &request.sources {
            validate_sources(sources)?;
        }
        if let Some(patterns) = &request.exclude_patterns {
            build_globset(patterns)?;
        }

        let now = Utc::now();
        let updated = self.mutate(|schedules| {
            let schedule = schedules
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| DrError::NotFound(format!("schedule '{id}'")))?;

            if let Some(cron) = request.cron {
                schedule.cron = cron;
            }
            if let Some(sources) = request.sources {
                schedule.sources = sources;
            }
            if let Some(kind) = request.kind {
                schedule.kind = kind;
            }
            if let Some(label) = request.label {
                schedule.label = label;
            }
            if let Some(compression) = request.compression {
                schedule.compression = compression;
            }
            if let Some(verify) = request.verify {
                schedule.verify = verify;
            }
            if let Some(patterns) = request.exclude_patterns {
                schedule.exclude_patterns = patterns;
            }
            if let Some(enabled) = request.enabled {
                schedule.enabled = enabled;
            }
            schedule.next_run = if schedule.enabled {
                self.next_run(&schedule.cron, now)
            } else {
                None
            };
            schedule.updated_at = now;
            Ok(schedule.clone())
        })?;

        self.sync_active(&updated);
        info!(schedule_id = %id, enabled = updated.enabled, "Schedule updated");
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<ScheduleDefinition> {
        let removed = self.mutate(|schedules| {
            let index = schedules
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| DrError::NotFound(format!("schedule '{id}'")))?;
            Ok(schedules.remove(index))
        })?;
        self.active.remove(id);
        info!(schedule_id = %id, "Schedule deleted");
        Ok(removed)
    }

    pub fn enable(&self, id: &str) -> Result<ScheduleDefinition> {
        self.update(
            id,
            UpdateScheduleRequest {
                enabled: Some(true),
                ..Default::default()
            },
        )
    }

    pub fn disable(&self, id: &str) -> Result<ScheduleDefinition> {
        self.update(
            id,
            UpdateScheduleRequest {
                enabled: Some(false),
                ..Default::default()
            },
        )
    }

    /// Manual, synchronous fire. Runs even if the schedule is disabled.
    pub fn trigger(&self, id: &str) -> Result<ScheduleRun> {
        let schedule = self.get(id)?;
        self.run(schedule)
    }

    /// Entry point for the cron driver. A disabled or deleted schedule is
    /// skipped and yields `Ok(None)`.
    pub fn on_fire(&self, id: &str) -> Result<Option<ScheduleRun>> {
        let schedule = match self.get(id) {
            Ok(schedule) => schedule,
            Err(DrError::NotFound(_)) => {
                warn!(schedule_id = %id, "Fired schedule no longer exists");
                self.active.remove(id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !schedule.enabled {
            info!(schedule_id = %id, "Schedule disabled, skipping fire");
            return Ok(None);
        }
        self.run(schedule).map(Some)
    }

    /// Snapshot of the active trigger map.
    pub fn active_triggers(&self) -> Vec<(String, ActiveTrigger)> {
        let mut triggers: Vec<_> = self
            .active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        triggers.sort_by(|a, b| a.0.cmp(&b.0));
        triggers
    }

    /// Note on the schedule that its trigger could not be armed. The schedule
    /// stays enabled so a corrected expression is picked up again.
    pub fn record_trigger_error(&self, id: &str, message: &str) -> Result<()> {
        self.mutate(|schedules| {
            if let Some(schedule) = schedules.iter_mut().find(|s| s.id == id) {
                schedule.last_error = Some(message.to_string());
            }
            Ok(())
        })
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.tracker.is_running(id)
    }

    pub fn summary(&self) -> Result<ScheduleSummary> {
        let schedules = self.load()?;
        let enabled = schedules.iter().filter(|s| s.enabled).count();
        let next = schedules
            .iter()
            .filter(|s| s.enabled)
            .filter_map(|s| s.next_run.map(|at| (at, s.id.clone())))
            .min();

        Ok(ScheduleSummary {
            total: schedules.len(),
            enabled,
            disabled: schedules.len() - enabled,
            running: self.tracker.running_count(),
            next_run: next.as_ref().map(|(at, _)| *at),
            next_schedule_id: next.map(|(_, id)| id),
        })
    }

    fn run(&self, schedule: ScheduleDefinition) -> Result<ScheduleRun> {
        let _guard = self
            .tracker
            .try_start(&schedule.id)
            .ok_or_else(|| DrError::Busy(format!("schedule '{}' is already running", schedule.id)))?;

        info!(schedule_id = %schedule.id, "Running scheduled backup");
        let started = Utc::now();
        let result = self.pipeline.create(BackupRequest {
            sources: schedule.sources.clone(),
            kind: schedule.kind,
            label: schedule.label.clone(),
            compression: Some(schedule.compression),
            compression_level: None,
            verify: Some(schedule.verify),
            exclude_patterns: schedule.exclude_patterns.clone(),
        });

        let recorded = self.record_run(&schedule.id, started, &result);
        match result {
            Ok(outcome) => {
                let schedule = match recorded {
                    Ok(Some(updated)) => updated,
                    Ok(None) => schedule,
                    Err(e) => {
                        warn!(schedule_id = %schedule.id, error = %e, "Could not record schedule run");
                        schedule
                    }
                };
                Ok(ScheduleRun { schedule, outcome })
            }
            Err(e) => {
                error!(schedule_id = %schedule.id, error = %e, "Scheduled backup failed; schedule stays active");
                Err(e)
            }
        }
    }

    /// Persist the bookkeeping of one run. `Ok(None)` if the schedule was
    /// deleted while it ran.
    fn record_run(
        &self,
        id: &str,
        started: DateTime<Utc>,
        result: &Result<BackupOutcome>,
    ) -> Result<Option<ScheduleDefinition>> {
        let finished = Utc::now();
        let updated = self.mutate(|schedules| {
            let Some(schedule) = schedules.iter_mut().find(|s| s.id == id) else {
                return Ok(None);
            };
            schedule.last_run = Some(started);
            schedule.run_count += 1;
            schedule.next_run = if schedule.enabled {
                self.next_run(&schedule.cron, finished)
            } else {
                None
            };
            match result {
                Ok(outcome) => {
                    schedule.last_status = Some(outcome.metadata.status);
                    schedule.last_backup_id = Some(outcome.backup_id.clone());
                    schedule.last_error = match outcome.metadata.status {
                        BackupStatus::Failed => outcome.warnings.first().cloned(),
                        _ => None,
                    };
                }
                Err(e) => {
                    schedule.last_status = Some(BackupStatus::Failed);
                    schedule.last_error = Some(e.to_string());
                }
            }
            Ok(Some(schedule.clone()))
        })?;

        if let Some(schedule) = &updated {
            self.sync_active(schedule);
        }
        Ok(updated)
    }

    fn next_run(&self, cron: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.triggers.next_run(cron, after) {
            Ok(next) => next,
            Err(e) => {
                warn!(cron = %cron, error = %e, "Could not compute next run");
                None
            }
        }
    }

    fn sync_active(&self, schedule: &ScheduleDefinition) {
        if schedule.enabled {
            self.active.insert(
                schedule.id.clone(),
                ActiveTrigger {
                    cron: schedule.cron.clone(),
                    next_run: schedule.next_run,
                },
            );
        } else {
            self.active.remove(&schedule.id);
        }
    }

    /// A missing schedules file is an empty registry.
    fn load(&self) -> Result<Vec<ScheduleDefinition>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: SchedulesFile = serde_json::from_str(&text)?;
        Ok(file.schedules)
    }

    fn save(&self, schedules: Vec<ScheduleDefinition>) -> Result<()> {
        let file = SchedulesFile {
            version: SCHEDULES_VERSION,
            schedules,
        };
        let text = serde_json::to_string_pretty(&file)?;
        atomic_write(&self.path, text.as_bytes())?;
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<ScheduleDefinition>) -> Result<T>) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| DrError::Task("schedule write lock poisoned".into()))?;
        let mut schedules = self.load()?;
        let out = f(&mut schedules)?;
        self.save(schedules)?;
        Ok(out)
    }
}

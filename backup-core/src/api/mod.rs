//! Operation surface of the backup core.
//!
//! [`DrService`] owns every component and exposes one async method per
//! operation. Input is validated before anything touches the disk; the file
//! work itself runs on tokio's blocking pool. Every method returns a
//! [`Response`] and never panics across this boundary.

pub mod response;

use crate::catalog::{BackupCatalog, CatalogQuery};
use crate::config::Config;
use crate::executor::{BackupOutcome, BackupPipeline, BackupRequest};
use crate::models::{
    BackupRecord, CreateScheduleRequest, ScheduleDefinition, ScheduleFilter, UpdateScheduleRequest,
};
use crate::restore::verify::{verify_backup, VerifyReport};
use crate::restore::{RestoreEngine, RestoreReport, RestoreRequest};
use crate::retention::{remove_backup, CleanupReport, RetentionEngine, RetentionPolicy};
use crate::schedule::{CronTriggerSource, ScheduleRegistry, ScheduleRun, TriggerSource};
use crate::status::{StatusAggregator, StatusReport, StatusRequest};
use crate::store::ContentStore;
use crate::utils::errors::{DrError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub use response::{ErrorBody, Response};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifyParams {
    pub backup_id: String,
    /// Size-only check of data files; defaults to a full content check
    #[serde(default)]
    pub quick: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanupParams {
    /// Defaults to true: nothing is deleted unless asked for explicitly
    #[serde(default)]
    pub dry_run: Option<bool>,
    /// Overrides the configured policy for this run
    #[serde(default)]
    pub retention_policy: Option<RetentionPolicy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub backup_id: String,
    pub space_reclaimed: u64,
}

fn require_id(id: &str, what: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(DrError::InvalidArguments(format!("{what} is required")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct DrService {
    config: Arc<Config>,
    store: Arc<ContentStore>,
    catalog: Arc<BackupCatalog>,
    pipeline: Arc<BackupPipeline>,
    restore: Arc<RestoreEngine>,
    retention: Arc<RetentionEngine>,
    schedules: Arc<ScheduleRegistry>,
    status: Arc<StatusAggregator>,
}

impl DrService {
    /// Build the service with cron trigger expressions.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_trigger_source(config, Arc::new(CronTriggerSource))
    }

    pub fn with_trigger_source(config: Config, triggers: Arc<dyn TriggerSource>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ContentStore::new(config.storage.backup_dir.clone()));
        let catalog = Arc::new(BackupCatalog::new(config.index_path()));
        let pipeline = Arc::new(BackupPipeline::new(
            store.clone(),
            catalog.clone(),
            config.backup.clone(),
        ));
        let restore = Arc::new(RestoreEngine::new(store.clone(), catalog.clone(), pipeline.clone()));
        let retention = Arc::new(RetentionEngine::new(store.clone(), catalog.clone(), config.retention));
        let schedules = Arc::new(ScheduleRegistry::new(
            config.schedules_path(),
            pipeline.clone(),
            triggers,
        ));
        schedules.load_active()?;
        let status = Arc::new(StatusAggregator::new(
            store.clone(),
            catalog.clone(),
            retention.clone(),
            schedules.clone(),
        ));

        info!(backup_dir = %config.storage.backup_dir.display(), "Backup service ready");

        Ok(Self {
            config: Arc::new(config),
            store,
            catalog,
            pipeline,
            restore,
            retention,
            schedules,
            status,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registry handle for the cron driver.
    pub fn schedules(&self) -> &Arc<ScheduleRegistry> {
        &self.schedules
    }

    /// Run `f` on the blocking pool and wrap its result.
    async fn blocking<T, F>(&self, f: F) -> Response<T>
    where
        F: FnOnce(&DrService) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.clone();
        let result = match tokio::task::spawn_blocking(move || f(&service)).await {
            Ok(result) => result,
            Err(e) => Err(DrError::Task(e.to_string())),
        };
        Response::from_result(result)
    }

    pub async fn create_backup(&self, request: BackupRequest) -> Response<BackupOutcome> {
        if let Err(e) = request.validate() {
            return Response::err(&e);
        }
        self.blocking(move |s| s.pipeline.create(request)).await
    }

    pub async fn verify_backup(&self, params: VerifyParams) -> Response<VerifyReport> {
        if let Err(e) = require_id(&params.backup_id, "backup_id") {
            return Response::err(&e);
        }
        self.blocking(move |s| {
            let record = s.catalog.require(&params.backup_id)?;
            verify_backup(&s.store, &record, params.quick.unwrap_or(false))
        })
        .await
    }

    pub async fn restore_backup(&self, request: RestoreRequest) -> Response<RestoreReport> {
        if let Err(e) = request.validate() {
            return Response::err(&e);
        }
        self.blocking(move |s| s.restore.restore(&request)).await
    }

    pub async fn cleanup_old_backups(&self, params: CleanupParams) -> Response<CleanupReport> {
        self.blocking(move |s| {
            let policy = params.retention_policy.unwrap_or(*s.retention.policy());
            s.retention
                .apply_with(&policy, params.dry_run.unwrap_or(true), Utc::now())
        })
        .await
    }

    pub async fn get_backup_status(&self, request: StatusRequest) -> Response<StatusReport> {
        self.blocking(move |s| s.status.status(&request)).await
    }

    pub async fn list_backups(&self, query: CatalogQuery) -> Response<Vec<BackupRecord>> {
        self.blocking(move |s| s.catalog.query(&query)).await
    }

    /// Manual deletion of one backup, content first, then its record.
    pub async fn delete_backup(&self, backup_id: String) -> Response<DeleteReport> {
        if let Err(e) = require_id(&backup_id, "backup_id") {
            return Response::err(&e);
        }
        self.blocking(move |s| {
            let space_reclaimed = remove_backup(&s.store, &s.catalog, &backup_id)?;
            Ok(DeleteReport {
                backup_id,
                space_reclaimed,
            })
        })
        .await
    }

    pub async fn create_schedule(&self, request: CreateScheduleRequest) -> Response<ScheduleDefinition> {
        self.blocking(move |s| s.schedules.create(request)).await
    }

    pub async fn list_schedules(&self, filter: ScheduleFilter) -> Response<Vec<ScheduleDefinition>> {
        self.blocking(move |s| s.schedules.list(&filter)).await
    }

    pub async fn get_schedule(&self, id: String) -> Response<ScheduleDefinition> {
        self.blocking(move |s| s.schedules.get(&id)).await
    }

    pub async fn update_schedule(&self, id: String, request: UpdateScheduleRequest) -> Response<ScheduleDefinition> {
        self.blocking(move |s| s.schedules.update(&id, request)).await
    }

    pub async fn delete_schedule(&self, id: String) -> Response<ScheduleDefinition> {
        self.blocking(move |s| s.schedules.delete(&id)).await
    }

    pub async fn enable_schedule(&self, id: String) -> Response<ScheduleDefinition> {
        self.blocking(move |s| s.schedules.enable(&id)).await
    }

    pub async fn disable_schedule(&self, id: String) -> Response<ScheduleDefinition> {
        self.blocking(move |s| s.schedules.disable(&id)).await
    }

    pub async fn trigger_schedule(&self, id: String) -> Response<ScheduleRun> {
        if let Err(e) = require_id(&id, "schedule id") {
            return Response::err(&e);
        }
        self.blocking(move |s| s.schedules.trigger(&id)).await
    }
}

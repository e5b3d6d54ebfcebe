//! Read-only health reporting over the catalog, retention and schedules.

use crate::catalog::{BackupCatalog, CatalogQuery, CatalogStatistics};
use crate::models::BackupRecord;
use crate::retention::RetentionEngine;
use crate::schedule::{ScheduleRegistry, ScheduleSummary};
use crate::store::ContentStore;
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_RECENT_LIMIT: usize = 5;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub include_schedules: bool,
    #[serde(default)]
    pub include_retention: bool,
    #[serde(default)]
    pub recent_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Critical,
}

/// Disagreements between the catalog and the content store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsistencyReport {
    /// Catalogued backups whose manifest or metadata is gone
    pub missing_content: Vec<String>,
    /// Backup directories nothing in the catalog refers to
    pub orphan_dirs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionSummary {
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
    pub expired: usize,
    pub keep: usize,
    pub delete: usize,
    pub reclaimable_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub statistics: CatalogStatistics,
    pub recent_backups: Vec<BackupRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedules: Option<ScheduleSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionSummary>,
    pub consistency: ConsistencyReport,
    pub health: Health,
    pub issues: Vec<String>,
}

pub struct StatusAggregator {
    store: Arc<ContentStore>,
    catalog: Arc<BackupCatalog>,
    retention: Arc<RetentionEngine>,
    schedules: Arc<ScheduleRegistry>,
}

impl StatusAggregator {
    pub fn new(
        store: Arc<ContentStore>,
        catalog: Arc<BackupCatalog>,
        retention: Arc<RetentionEngine>,
        schedules: Arc<ScheduleRegistry>,
    ) -> Self {
        Self {
            store,
            catalog,
            retention,
            schedules,
        }
    }

    pub fn status(&self, request: &StatusRequest) -> Result<StatusReport> {
        let records = self.catalog.get_all()?;
        let statistics = CatalogStatistics::from_records(&records);
        let recent_backups = self
            .catalog
            .query(&CatalogQuery::recent(request.recent_limit.unwrap_or(DEFAULT_RECENT_LIMIT)))?;
        let consistency = self.consistency(&records)?;

        let schedules = if request.include_schedules {
            Some(self.schedules.summary()?)
        } else {
            None
        };

        let retention = if request.include_retention {
            let preview = self.retention.preview()?;
            Some(RetentionSummary {
                daily: preview.daily.len(),
                weekly: preview.weekly.len(),
                monthly: preview.monthly.len(),
                expired: preview.expired.len(),
                keep: preview.keep.len(),
                delete: preview.delete.len(),
                reclaimable_bytes: preview.reclaimable_bytes,
            })
        } else {
            None
        };

        let (health, issues) = assess(&statistics, schedules.as_ref(), retention.as_ref(), &consistency);
        debug!(health = ?health, issues = issues.len(), "Status computed");

        Ok(StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            statistics,
            recent_backups,
            schedules,
            retention,
            consistency,
            health,
            issues,
        })
    }

    fn consistency(&self, records: &[BackupRecord]) -> Result<ConsistencyReport> {
        let catalogued: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let missing_content = records
            .iter()
            .filter(|r| !self.store.is_complete(&r.id))
            .map(|r| r.id.clone())
            .collect();
        let orphan_dirs = self
            .store
            .list_backup_dirs()?
            .into_iter()
            .filter(|id| !catalogued.contains(id.as_str()))
            .collect();
        Ok(ConsistencyReport {
            missing_content,
            orphan_dirs,
        })
    }
}

fn assess(
    statistics: &CatalogStatistics,
    schedules: Option<&ScheduleSummary>,
    retention: Option<&RetentionSummary>,
    consistency: &ConsistencyReport,
) -> (Health, Vec<String>) {
    let mut health = Health::Healthy;
    let mut issues = Vec::new();
    let mut raise = |level: Health, issue: String| {
        health = health.max(level);
        issues.push(issue);
    };

    if statistics.total_backups == 0 {
        raise(Health::Warning, "no backups exist".into());
    }
    if let Some(retention) = retention {
        if retention.expired > 0 {
            raise(
                Health::Warning,
                format!("{} backup(s) are past the retention horizon", retention.expired),
            );
        }
    }
    if let Some(schedules) = schedules {
        if schedules.enabled == 0 {
            raise(Health::Warning, "no enabled schedules".into());
        }
    }
    if !consistency.missing_content.is_empty() {
        raise(
            Health::Critical,
            format!(
                "{} catalogued backup(s) are missing their manifest or metadata",
                consistency.missing_content.len()
            ),
        );
    }
    if !consistency.orphan_dirs.is_empty() {
        raise(
            Health::Warning,
            format!("orphaned backup directories: {}", consistency.orphan_dirs.len()),
        );
    }

    (health, issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::record;
    use crate::executor::tests::Fixture;
    use crate::models::BackupKind;
    use crate::retention::RetentionPolicy;
    use crate::schedule::tests::{create_request, registry};
    use chrono::{Duration, Utc};
    use std::fs;

    fn aggregator(fx: &Fixture) -> StatusAggregator {
        StatusAggregator::new(
            fx.store.clone(),
            fx.catalog.clone(),
            Arc::new(RetentionEngine::new(
                fx.store.clone(),
                fx.catalog.clone(),
                RetentionPolicy::default(),
            )),
            Arc::new(registry(fx)),
        )
    }

    fn everything() -> StatusRequest {
        StatusRequest {
            include_schedules: true,
            include_retention: true,
            recent_limit: None,
        }
    }

    #[test]
    fn test_empty_store_is_a_warning() -> Result<()> {
        let fx = Fixture::new();
        let report = aggregator(&fx).status(&StatusRequest::default())?;
        assert_eq!(report.health, Health::Warning);
        assert_eq!(report.statistics.total_backups, 0);
        assert!(report.schedules.is_none());
        assert!(report.retention.is_none());
        Ok(())
    }

    #[test]
    fn test_healthy_with_backup_and_schedule() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        fx.pipeline.create(fx.request(&src))?;
        let status = aggregator(&fx);
        status.schedules.create(create_request("nightly", vec!["/srv".into()]))?;

        let report = status.status(&everything())?;
        assert_eq!(report.health, Health::Healthy, "{:?}", report.issues);
        assert_eq!(report.recent_backups.len(), 1);
        assert_eq!(report.schedules.as_ref().map(|s| s.enabled), Some(1));
        assert_eq!(report.retention.as_ref().map(|r| r.daily), Some(1));
        Ok(())
    }

    #[test]
    fn test_status_is_idempotent() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        fx.pipeline.create(fx.request(&src))?;
        let status = aggregator(&fx);

        let first = status.status(&everything())?;
        let second = status.status(&everything())?;
        assert_eq!(first.statistics, second.statistics);
        assert_eq!(first.retention, second.retention);
        assert_eq!(first.health, second.health);
        Ok(())
    }

    #[test]
    fn test_expired_and_missing_schedules_warn() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;
        let mut old = fx.catalog.require(&outcome.backup_id)?;
        fx.catalog.remove(&old.id)?;
        old.created_at = Utc::now() - Duration::days(500);
        fx.catalog.add(old)?;

        let report = aggregator(&fx).status(&everything())?;
        assert_eq!(report.health, Health::Warning);
        assert_eq!(report.retention.map(|r| r.expired), Some(1));
        assert_eq!(report.issues.len(), 2);
        Ok(())
    }

    #[test]
    fn test_inconsistency_is_reported() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;

        // Record without content
        fx.catalog.add(record("backup-ghost", BackupKind::Full, Utc::now(), 10))?;
        // Content without record
        fs::create_dir_all(fx.store.data_dir("backup-stray"))?;

        let report = aggregator(&fx).status(&StatusRequest::default())?;
        assert_eq!(report.health, Health::Critical);
        assert_eq!(report.consistency.missing_content, vec!["backup-ghost".to_string()]);
        assert_eq!(report.consistency.orphan_dirs, vec!["backup-stray".to_string()]);
        assert!(!report.consistency.missing_content.contains(&outcome.backup_id));
        Ok(())
    }
}

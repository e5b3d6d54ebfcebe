//! Tiered retention: decide which backups to keep and prune the rest.
//!
//! Every backup falls into one age tier. The daily tier is always kept;
//! the weekly and monthly tiers keep one representative per calendar
//! bucket for the most recent `weekly` weeks and `monthly` months.
//! Everything else, including the expired tier, is deleted.

use crate::catalog::BackupCatalog;
use crate::models::{BackupKind, BackupRecord};
use crate::store::ContentStore;
use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Days during which every backup is kept
    pub daily: u32,
    /// Weekly representatives kept beyond the daily window
    pub weekly: u32,
    /// Monthly representatives kept beyond the weekly window
    pub monthly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 12,
        }
    }
}

impl RetentionPolicy {
    /// Age in days from which a backup is expired.
    pub fn horizon_days(&self) -> i64 {
        i64::from(self.daily) + i64::from(self.weekly) * 7 + i64::from(self.monthly) * 30
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
    Expired,
}

pub fn classify(age_days: i64, policy: &RetentionPolicy) -> Tier {
    let daily = i64::from(policy.daily);
    let weekly = daily + i64::from(policy.weekly) * 7;
    if age_days < daily {
        Tier::Daily
    } else if age_days < weekly {
        Tier::Weekly
    } else if age_days < policy.horizon_days() {
        Tier::Monthly
    } else {
        Tier::Expired
    }
}

/// Week bucket: weeks start on Sunday, week 1 contains January 1st.
fn week_key(at: DateTime<Utc>) -> (i32, u32) {
    let date = at.date_naive();
    let jan1_offset = NaiveDate::from_ymd_opt(date.year(), 1, 1)
        .map(|d| d.weekday().num_days_from_sunday())
        .unwrap_or(0);
    (date.year(), (date.ordinal0() + jan1_offset) / 7 + 1)
}

fn month_key(at: DateTime<Utc>) -> i64 {
    i64::from(at.year()) * 12 + i64::from(at.month0())
}

/// Better representative first: full over incremental, then newest, then id.
fn representative_order(a: &BackupRecord, b: &BackupRecord) -> Ordering {
    let rank = |r: &BackupRecord| matches!(r.kind, BackupKind::Full);
    rank(b)
        .cmp(&rank(a))
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.id.cmp(&a.id))
}

/// One representative for each of the `limit` most recent buckets.
fn representatives<K: Ord>(
    records: &[&BackupRecord],
    limit: u32,
    key: impl Fn(&BackupRecord) -> K,
) -> Vec<String> {
    let mut buckets: BTreeMap<K, Vec<&BackupRecord>> = BTreeMap::new();
    for record in records.iter().copied() {
        buckets.entry(key(record)).or_default().push(record);
    }

    buckets
        .into_values()
        .rev()
        .take(limit as usize)
        .filter_map(|mut bucket| {
            bucket.sort_by(|a, b| representative_order(a, b));
            bucket.first().map(|r| r.id.clone())
        })
        .collect()
}

/// Four-way categorization plus the resulting keep/delete sets.
#[derive(Debug, Clone, Serialize)]
pub struct RetentionPreview {
    pub policy: RetentionPolicy,
    pub evaluated_at: DateTime<Utc>,
    pub daily: Vec<String>,
    pub weekly: Vec<String>,
    pub monthly: Vec<String>,
    pub expired: Vec<String>,
    pub keep: Vec<String>,
    pub delete: Vec<String>,
    /// Stored bytes freed if the delete set is removed
    pub reclaimable_bytes: u64,
}

/// Pure selection over a set of records. Ids in every list are newest first.
pub fn plan(records: &[BackupRecord], policy: &RetentionPolicy, now: DateTime<Utc>) -> RetentionPreview {
    let mut sorted: Vec<&BackupRecord> = records.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

    let mut tiers: [Vec<&BackupRecord>; 4] = Default::default();
    for record in sorted.iter().copied() {
        let slot = match classify(record.age_days(now), policy) {
            Tier::Daily => 0,
            Tier::Weekly => 1,
            Tier::Monthly => 2,
            Tier::Expired => 3,
        };
        tiers[slot].push(record);
    }

    let mut kept: HashSet<String> = tiers[0].iter().map(|r| r.id.clone()).collect();
    kept.extend(representatives(&tiers[1], policy.weekly, |r| week_key(r.created_at)));
    kept.extend(representatives(&tiers[2], policy.monthly, |r| month_key(r.created_at)));

    fn ids(tier: &[&BackupRecord]) -> Vec<String> {
        tier.iter().map(|r| r.id.clone()).collect()
    }

    let mut keep = Vec::new();
    let mut delete = Vec::new();
    let mut reclaimable_bytes = 0;
    for record in &sorted {
        if kept.contains(&record.id) {
            keep.push(record.id.clone());
        } else {
            delete.push(record.id.clone());
            reclaimable_bytes += record.compressed_size;
        }
    }

    RetentionPreview {
        policy: *policy,
        evaluated_at: now,
        daily: ids(&tiers[0]),
        weekly: ids(&tiers[1]),
        monthly: ids(&tiers[2]),
        expired: ids(&tiers[3]),
        keep,
        delete,
        reclaimable_bytes,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupFailure {
    pub backup_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Ids actually removed (empty on a dry run)
    pub deleted: Vec<String>,
    pub failed: Vec<CleanupFailure>,
    pub kept: usize,
    /// Bytes freed, or that would be freed on a dry run
    pub space_reclaimed: u64,
    pub preview: RetentionPreview,
}

/// Remove one backup's directory and its catalog record.
///
/// The directory goes first so a crash in between leaves a record with
/// missing content, which the status check reports. Returns the stored
/// bytes freed.
pub fn remove_backup(store: &ContentStore, catalog: &BackupCatalog, id: &str) -> Result<u64> {
    let record = catalog.get(id)?;
    if record.is_none() && !store.exists(id) {
        return Err(DrError::NotFound(format!("backup {id}")));
    }

    match store.delete_backup(id) {
        Ok(()) | Err(DrError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    catalog.remove(id)?;

    info!(backup_id = %id, "Deleted backup");
    Ok(record.map(|r| r.compressed_size).unwrap_or(0))
}

pub struct RetentionEngine {
    store: Arc<ContentStore>,
    catalog: Arc<BackupCatalog>,
    policy: RetentionPolicy,
}

impl RetentionEngine {
    pub fn new(store: Arc<ContentStore>, catalog: Arc<BackupCatalog>, policy: RetentionPolicy) -> Self {
        Self {
            store,
            catalog,
            policy,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn preview(&self) -> Result<RetentionPreview> {
        self.preview_at(&self.policy, Utc::now())
    }

    pub fn preview_at(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<RetentionPreview> {
        Ok(plan(&self.catalog.get_all()?, policy, now))
    }

    pub fn apply(&self, dry_run: bool) -> Result<CleanupReport> {
        self.apply_with(&self.policy, dry_run, Utc::now())
    }

    /// Apply `policy` as of `now`. Individual deletion failures are
    /// reported and do not stop the run.
    pub fn apply_with(&self, policy: &RetentionPolicy, dry_run: bool, now: DateTime<Utc>) -> Result<CleanupReport> {
        let preview = self.preview_at(policy, now)?;

        if dry_run {
            info!(
                keep = preview.keep.len(),
                delete = preview.delete.len(),
                reclaimable_bytes = preview.reclaimable_bytes,
                "Retention dry run"
            );
            return Ok(CleanupReport {
                dry_run,
                deleted: Vec::new(),
                failed: Vec::new(),
                kept: preview.keep.len(),
                space_reclaimed: preview.reclaimable_bytes,
                preview,
            });
        }

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        let mut space_reclaimed = 0;
        for id in &preview.delete {
            match remove_backup(&self.store, &self.catalog, id) {
                Ok(bytes) => {
                    space_reclaimed += bytes;
                    deleted.push(id.clone());
                }
                Err(e) => {
                    warn!(backup_id = %id, error = %e, "Failed to delete expired backup");
                    failed.push(CleanupFailure {
                        backup_id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            deleted = deleted.len(),
            failed = failed.len(),
            space_reclaimed,
            "Retention applied"
        );

        Ok(CleanupReport {
            dry_run,
            kept: preview.keep.len() + failed.len(),
            deleted,
            failed,
            space_reclaimed,
            preview,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::record;
    use crate::executor::tests::Fixture;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
    }

    fn daily_history(days: i64, now: DateTime<Utc>) -> Vec<BackupRecord> {
        (0..days)
            .map(|age| {
                let kind = if age % 7 == 3 { BackupKind::Full } else { BackupKind::Incremental };
                record(&format!("b{age:03}"), kind, now - Duration::days(age) - Duration::minutes(5), 1000)
            })
            .collect()
    }

    #[test]
    fn test_classify_boundaries() {
        let policy = RetentionPolicy::default();
        assert_eq!(classify(0, &policy), Tier::Daily);
        assert_eq!(classify(6, &policy), Tier::Daily);
        assert_eq!(classify(7, &policy), Tier::Weekly);
        assert_eq!(classify(34, &policy), Tier::Weekly);
        assert_eq!(classify(35, &policy), Tier::Monthly);
        assert_eq!(classify(394, &policy), Tier::Monthly);
        assert_eq!(classify(395, &policy), Tier::Expired);

        let none = RetentionPolicy { daily: 0, weekly: 0, monthly: 0 };
        assert_eq!(classify(0, &none), Tier::Expired);
    }

    #[test]
    fn test_week_key_starts_on_sunday() {
        // 2025-01-01 is a Wednesday: Jan 1..4 are week 1, Sunday Jan 5 opens week 2
        let jan = |d| Utc.with_ymd_and_hms(2025, 1, d, 0, 0, 0).unwrap();
        assert_eq!(week_key(jan(1)), (2025, 1));
        assert_eq!(week_key(jan(4)), (2025, 1));
        assert_eq!(week_key(jan(5)), (2025, 2));
        assert_eq!(month_key(jan(5)), 2025 * 12);
    }

    #[test]
    fn test_four_hundred_days_of_daily_backups() {
        let now = now();
        let policy = RetentionPolicy::default();
        let records = daily_history(400, now);
        let preview = plan(&records, &policy, now);

        assert_eq!(preview.daily.len(), 7);
        let kept: HashSet<&String> = preview.keep.iter().collect();
        for id in &preview.daily {
            assert!(kept.contains(id));
        }

        let weekly_kept = preview.weekly.iter().filter(|id| kept.contains(id)).count();
        let monthly_kept = preview.monthly.iter().filter(|id| kept.contains(id)).count();
        assert!(weekly_kept <= 4 && weekly_kept > 0);
        assert!(monthly_kept <= 12 && monthly_kept > 0);
        assert_eq!(preview.keep.len(), 7 + weekly_kept + monthly_kept);

        for r in &records {
            if r.age_days(now) >= policy.horizon_days() {
                assert!(preview.delete.contains(&r.id), "{} should be deleted", r.id);
            }
        }
        assert_eq!(preview.keep.len() + preview.delete.len(), 400);
        assert_eq!(preview.reclaimable_bytes, preview.delete.len() as u64 * 500);
    }

    #[test]
    fn test_representative_prefers_full_then_newest() {
        let now = now();
        let policy = RetentionPolicy { daily: 0, weekly: 1, monthly: 0 };
        // Same week, days 1..3 back from a Sunday-start week
        let base = Utc.with_ymd_and_hms(2025, 6, 14, 12, 0, 0).unwrap();
        let records = vec![
            record("newest-incr", BackupKind::Incremental, base, 10),
            record("older-full", BackupKind::Full, base - Duration::days(2), 10),
            record("oldest-full", BackupKind::Full, base - Duration::days(3), 10),
        ];
        let preview = plan(&records, &policy, now);
        assert_eq!(preview.keep, vec!["older-full".to_string()]);

        let records = vec![
            record("newer", BackupKind::Incremental, base, 10),
            record("older", BackupKind::Incremental, base - Duration::days(1), 10),
        ];
        let preview = plan(&records, &policy, now);
        assert_eq!(preview.keep, vec!["newer".to_string()]);
    }

    #[test]
    fn test_empty_catalog_and_zero_policy() {
        let preview = plan(&[], &RetentionPolicy::default(), now());
        assert!(preview.keep.is_empty() && preview.delete.is_empty());

        let records = daily_history(3, now());
        let none = RetentionPolicy { daily: 0, weekly: 0, monthly: 0 };
        let preview = plan(&records, &none, now());
        assert_eq!(preview.delete.len(), 3);
    }

    #[test]
    fn test_apply_dry_run_then_execute() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let fresh = fx.pipeline.create(fx.request(&src))?;

        // An old backup that only exists in the catalog and one with content
        let mut stale = record("backup-2001-01-01T00-00-00-000Z-aaaaaa", BackupKind::Full, now() - Duration::days(900), 4000);
        stale.compressed_size = 4000;
        fx.catalog.add(stale)?;
        let old_with_content = fx.pipeline.create(fx.request(&src))?;
        let mut old_record = fx.catalog.require(&old_with_content.backup_id)?;
        old_record.created_at = Utc::now() - Duration::days(1000);
        fx.catalog.remove(&old_record.id)?;
        fx.catalog.add(old_record.clone())?;

        let engine = RetentionEngine::new(fx.store.clone(), fx.catalog.clone(), RetentionPolicy::default());

        let report = engine.apply(true)?;
        assert!(report.dry_run);
        assert!(report.deleted.is_empty());
        assert_eq!(report.preview.delete.len(), 2);
        assert_eq!(report.space_reclaimed, 4000 + old_record.compressed_size);
        assert_eq!(fx.catalog.get_all()?.len(), 3);
        assert!(fx.store.exists(&old_record.id));

        let report = engine.apply(false)?;
        assert_eq!(report.deleted.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.kept, 1);
        assert_eq!(report.space_reclaimed, 4000 + old_record.compressed_size);
        assert!(!fx.store.exists(&old_record.id));
        assert!(fx.store.exists(&fresh.backup_id));
        assert_eq!(fx.catalog.get_all()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_remove_unknown_backup() {
        let fx = Fixture::new();
        let result = remove_backup(&fx.store, &fx.catalog, "backup-nope");
        assert!(matches!(result, Err(DrError::NotFound(_))));
    }
}

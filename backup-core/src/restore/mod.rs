//! Restore engine - brings backup contents back onto the live filesystem.
//!
//! Restores are non-destructive by default: an existing file whose
//! modification time differs from the captured one is a conflict and is
//! skipped unless `overwrite` is set. With `overwrite`, a file that merely
//! looks identical (same size and mtime) is also checksummed, so content
//! damaged in place is repaired. Overwrites are preceded by a safety
//! snapshot of the files about to be replaced.

pub mod verify;

use crate::catalog::BackupCatalog;
use crate::executor::manifest::{join_manifest_path, ManifestEntry};
use crate::executor::{BackupPipeline, BackupRequest};
use crate::fs::metadata::{same_mtime, system_time_to_utc, FileMetadata};
use crate::integrity::{checksum_file, checksum_text, ChecksumReader};
use crate::models::BackupKind;
use crate::store::ContentStore;
use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestoreRequest {
    pub backup_id: String,
    /// Restore under this directory instead of the captured locations
    #[serde(default)]
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub overwrite: bool,
    /// Safety snapshot before overwriting; defaults to `overwrite`
    #[serde(default)]
    pub pre_backup: Option<bool>,
    #[serde(default)]
    pub dry_run: bool,
    /// Restore only entries whose captured or data path is, or lies under, one of these
    #[serde(default)]
    pub selective: Vec<String>,
}

impl RestoreRequest {
    pub fn new(backup_id: impl Into<String>) -> Self {
        Self {
            backup_id: backup_id.into(),
            ..Self::default()
        }
    }

    /// Validate and resolve whether a safety snapshot is wanted.
    pub fn validate(&self) -> Result<bool> {
        if self.backup_id.trim().is_empty() {
            return Err(DrError::InvalidArguments("backup_id is required".into()));
        }
        match self.pre_backup {
            Some(true) if !self.overwrite => Err(DrError::InvalidArguments(
                "pre_backup requires overwrite=true; nothing would be overwritten".into(),
            )),
            Some(pre_backup) => Ok(pre_backup),
            None => Ok(self.overwrite),
        }
    }

    fn selects(&self, entry: &ManifestEntry) -> bool {
        if self.selective.is_empty() {
            return true;
        }
        self.selective.iter().any(|wanted| {
            let wanted = wanted.trim_end_matches('/');
            let wanted_rel = wanted.trim_start_matches('/');
            is_under(&entry.source_path, wanted) || is_under(&entry.path, wanted_rel)
        })
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    Overwrite,
    Skip,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreConflict {
    pub path: String,
    pub existing_modified: DateTime<Utc>,
    pub backup_modified: DateTime<Utc>,
    pub action: ConflictAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub dry_run: bool,
    /// Files written (or that would be written, in a dry run)
    pub files_restored: u64,
    pub files_skipped: u64,
    pub bytes_restored: u64,
    pub conflicts: Vec<RestoreConflict>,
    pub failed: Vec<RestoreFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_backup_id: Option<String>,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
}

enum Planned {
    Write { overwrites: bool },
    Skip,
}

struct PlanItem<'a> {
    entry: &'a ManifestEntry,
    target: PathBuf,
    action: Planned,
}

pub struct RestoreEngine {
    store: Arc<ContentStore>,
    catalog: Arc<BackupCatalog>,
    pipeline: Arc<BackupPipeline>,
}

impl RestoreEngine {
    pub fn new(store: Arc<ContentStore>, catalog: Arc<BackupCatalog>, pipeline: Arc<BackupPipeline>) -> Self {
        Self {
            store,
            catalog,
            pipeline,
        }
    }

    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        let pre_backup = request.validate()?;
        let start_time = Instant::now();
        let id = request.backup_id.as_str();

        let record = self.catalog.require(id)?;
        let manifest_text = self.store.read_manifest_text(id)?;
        let actual = checksum_text(&manifest_text);
        if !actual.eq_ignore_ascii_case(&record.manifest_checksum) {
            return Err(DrError::Integrity(format!(
                "manifest checksum mismatch for {id}: expected {}, got {actual}",
                record.manifest_checksum
            )));
        }
        let manifest: Vec<ManifestEntry> = serde_json::from_str(&manifest_text)?;

        let (plan, conflicts) = self.plan(request, &manifest);

        let mut report = RestoreReport {
            backup_id: id.to_string(),
            dry_run: request.dry_run,
            files_restored: 0,
            files_skipped: 0,
            bytes_restored: 0,
            conflicts,
            failed: Vec::new(),
            pre_backup_id: None,
            duration_ms: 0,
            warnings: Vec::new(),
        };

        if request.dry_run {
            for item in &plan {
                match item.action {
                    Planned::Write { .. } => {
                        report.files_restored += 1;
                        report.bytes_restored += item.entry.size;
                    }
                    Planned::Skip => report.files_skipped += 1,
                }
            }
            report.duration_ms = start_time.elapsed().as_millis() as u64;
            info!(
                backup_id = %id,
                would_restore = report.files_restored,
                would_skip = report.files_skipped,
                conflicts = report.conflicts.len(),
                "Dry-run restore planned"
            );
            return Ok(report);
        }

        if pre_backup {
            let at_risk: Vec<String> = plan
                .iter()
                .filter(|item| matches!(item.action, Planned::Write { overwrites: true }))
                .map(|item| item.target.to_string_lossy().into_owned())
                .collect();

            if !at_risk.is_empty() {
                let snapshot = self.pipeline.create(BackupRequest {
                    sources: at_risk,
                    kind: BackupKind::Full,
                    label: Some(format!("pre-restore {id}")),
                    verify: Some(false),
                    ..BackupRequest::default()
                })?;
                info!(backup_id = %id, pre_backup_id = %snapshot.backup_id, "Safety snapshot taken");
                report.warnings.extend(snapshot.warnings);
                report.pre_backup_id = Some(snapshot.backup_id);
            }
        }

        for item in &plan {
            if let Planned::Skip = item.action {
                report.files_skipped += 1;
                continue;
            }

            match self.restore_entry(id, item.entry, &item.target) {
                Ok(bytes) => {
                    report.files_restored += 1;
                    report.bytes_restored += bytes;
                }
                Err(e) => {
                    warn!("Failed to restore {}: {}", item.target.display(), e);
                    report.warnings.push(format!("{}: {}", item.target.display(), e));
                    report.failed.push(RestoreFailure {
                        path: item.target.to_string_lossy().into_owned(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.duration_ms = start_time.elapsed().as_millis() as u64;
        info!(
            backup_id = %id,
            restored = report.files_restored,
            skipped = report.files_skipped,
            failed = report.failed.len(),
            bytes = report.bytes_restored,
            duration_ms = report.duration_ms,
            "Restore finished"
        );
        Ok(report)
    }

    /// Decide what happens to every selected entry, without touching anything.
    fn plan<'a>(
        &self,
        request: &RestoreRequest,
        manifest: &'a [ManifestEntry],
    ) -> (Vec<PlanItem<'a>>, Vec<RestoreConflict>) {
        let mut plan = Vec::new();
        let mut conflicts = Vec::new();

        for entry in manifest.iter().filter(|e| request.selects(e)) {
            let target = match &request.destination {
                Some(destination) => join_manifest_path(destination, &entry.path),
                None => PathBuf::from(&entry.source_path),
            };

            let action = match fs::metadata(&target) {
                Err(_) => Planned::Write { overwrites: false },
                Ok(existing) => {
                    let existing_modified = existing
                        .modified()
                        .map(system_time_to_utc)
                        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

                    let looks_identical =
                        same_mtime(existing_modified, entry.modified) && existing.len() == entry.size;
                    let identical =
                        looks_identical && (!request.overwrite || content_matches(&target, entry));

                    if identical {
                        Planned::Skip
                    } else {
                        let action = if request.overwrite {
                            ConflictAction::Overwrite
                        } else {
                            ConflictAction::Skip
                        };
                        conflicts.push(RestoreConflict {
                            path: target.to_string_lossy().into_owned(),
                            existing_modified,
                            backup_modified: entry.modified,
                            action,
                        });
                        match action {
                            ConflictAction::Overwrite => Planned::Write { overwrites: true },
                            ConflictAction::Skip => Planned::Skip,
                        }
                    }
                }
            };

            plan.push(PlanItem { entry, target, action });
        }

        (plan, conflicts)
    }

    /// Decode one entry into a temp sibling, check its checksum, then publish.
    fn restore_entry(&self, id: &str, entry: &ManifestEntry, target: &Path) -> Result<u64> {
        if target.is_dir() {
            return Err(DrError::InvalidArguments(format!(
                "{} is a directory",
                target.display()
            )));
        }
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "restore".into());
        let tmp_path = parent.join(format!(".{}.restore-{}", file_name, uuid::Uuid::new_v4().simple()));

        let result = self.write_verified(id, entry, &tmp_path).and_then(|bytes| {
            FileMetadata::apply_to_path(&tmp_path, entry.modified, entry.mode)?;
            fs::rename(&tmp_path, target)?;
            Ok(bytes)
        });

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    fn write_verified(&self, id: &str, entry: &ManifestEntry, tmp_path: &Path) -> Result<u64> {
        let data = self.store.open_data(id, &entry.data_relative_path())?;
        let source: Box<dyn Read> = if entry.compressed {
            Box::new(zstd::stream::read::Decoder::new(data)?)
        } else {
            Box::new(BufReader::new(data))
        };

        let mut reader = ChecksumReader::new(source);
        let mut out = BufWriter::new(File::create(tmp_path)?);
        io::copy(&mut reader, &mut out)?;
        out.flush()?;
        out.into_inner()
            .map_err(|e| DrError::Io(e.into_error()))?
            .sync_all()?;

        let (actual, bytes) = reader.finish();
        if !actual.eq_ignore_ascii_case(&entry.checksum) {
            return Err(DrError::Integrity(format!(
                "{}: expected checksum {}, got {}",
                entry.path, entry.checksum, actual
            )));
        }
        Ok(bytes)
    }
}

fn content_matches(target: &Path, entry: &ManifestEntry) -> bool {
    match checksum_file(target) {
        Ok(actual) => actual.eq_ignore_ascii_case(&entry.checksum),
        Err(e) => {
            warn!("Could not checksum {}: {}", target.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::Fixture;
    use chrono::Duration;

    fn engine(fx: &Fixture) -> RestoreEngine {
        RestoreEngine::new(fx.store.clone(), fx.catalog.clone(), fx.pipeline.clone())
    }

    fn set_mtime(path: &Path, when: DateTime<Utc>) {
        FileMetadata::apply_to_path(path, when, None).unwrap();
    }

    #[test]
    fn test_validation() {
        assert!(RestoreRequest::new("").validate().is_err());

        let mut request = RestoreRequest::new("b1");
        assert!(!request.validate().unwrap());

        request.overwrite = true;
        assert!(request.validate().unwrap());

        request.pre_backup = Some(false);
        assert!(!request.validate().unwrap());

        request.overwrite = false;
        request.pre_backup = Some(true);
        assert!(matches!(request.validate(), Err(DrError::InvalidArguments(_))));
    }

    #[test]
    fn test_unknown_backup_is_not_found() {
        let fx = Fixture::new();
        let result = engine(&fx).restore(&RestoreRequest::new("backup-missing"));
        assert!(matches!(result, Err(DrError::NotFound(_))));
    }

    #[test]
    fn test_restore_into_destination() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;

        let dest = fx.temp_dir.path().join("restored");
        let mut request = RestoreRequest::new(&outcome.backup_id);
        request.destination = Some(dest.clone());
        let report = engine(&fx).restore(&request)?;

        assert_eq!(report.files_restored, 3);
        assert_eq!(report.bytes_restored, 300);
        assert!(report.conflicts.is_empty());
        assert!(report.failed.is_empty());

        let manifest = fx.store.read_manifest(&outcome.backup_id)?;
        for entry in &manifest {
            let restored = join_manifest_path(&dest, &entry.path);
            assert_eq!(fs::read(&restored)?, fs::read(&entry.source_path)?);
            let meta = FileMetadata::from_path(&restored)?;
            assert!(same_mtime(meta.modified, entry.modified));
        }
        Ok(())
    }

    #[test]
    fn test_dry_run_reports_conflict_without_side_effects() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;

        let changed = src.join("a.txt");
        fs::write(&changed, "changed locally")?;
        set_mtime(&changed, Utc::now() + Duration::hours(1));

        let mut request = RestoreRequest::new(&outcome.backup_id);
        request.dry_run = true;
        let report = engine(&fx).restore(&request)?;

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].path, changed.to_string_lossy());
        assert_eq!(report.conflicts[0].action, ConflictAction::Skip);
        assert_eq!(fs::read_to_string(&changed)?, "changed locally");
        assert_eq!(fx.catalog.get_all()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_skip_conflict_keeps_local_file() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;

        fs::write(src.join("a.txt"), "local edit")?;
        set_mtime(&src.join("a.txt"), Utc::now() + Duration::hours(2));
        fs::remove_file(src.join("b.txt"))?;

        let report = engine(&fx).restore(&RestoreRequest::new(&outcome.backup_id))?;
        assert_eq!(report.files_restored, 1);
        assert_eq!(report.files_skipped, 2);
        assert_eq!(fs::read_to_string(src.join("a.txt"))?, "local edit");
        assert_eq!(fs::read_to_string(src.join("b.txt"))?, "line\n".repeat(20));
        assert!(report.pre_backup_id.is_none());
        Ok(())
    }

    #[test]
    fn test_overwrite_takes_safety_snapshot() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;

        fs::write(src.join("a.txt"), "local edit")?;
        set_mtime(&src.join("a.txt"), Utc::now() + Duration::hours(2));

        let mut request = RestoreRequest::new(&outcome.backup_id);
        request.overwrite = true;
        let report = engine(&fx).restore(&request)?;

        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].action, ConflictAction::Overwrite);
        assert_eq!(fs::read_to_string(src.join("a.txt"))?, "a".repeat(100));

        let snapshot_id = report.pre_backup_id.expect("snapshot taken");
        let snapshot = fx.catalog.require(&snapshot_id)?;
        assert_eq!(snapshot.kind, BackupKind::Full);
        assert_eq!(snapshot.file_count, 1);
        assert_eq!(snapshot.total_size, "local edit".len() as u64);
        Ok(())
    }

    #[test]
    fn test_overwrite_repairs_damage_that_kept_size_and_mtime() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;
        let manifest = fx.store.read_manifest(&outcome.backup_id)?;
        let a = manifest.iter().find(|e| e.source_path.ends_with("a.txt")).unwrap();

        let damaged = src.join("a.txt");
        fs::write(&damaged, "Z".repeat(100))?;
        set_mtime(&damaged, a.modified);

        // Without overwrite the look-alike stays untouched
        let report = engine(&fx).restore(&RestoreRequest::new(&outcome.backup_id))?;
        assert_eq!(report.files_skipped, 3);
        assert_eq!(fs::read_to_string(&damaged)?, "Z".repeat(100));

        let mut request = RestoreRequest::new(&outcome.backup_id);
        request.overwrite = true;
        let report = engine(&fx).restore(&request)?;
        assert_eq!(report.files_restored, 1);
        assert_eq!(report.files_skipped, 2);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].path, damaged.to_string_lossy());
        assert_eq!(fs::read_to_string(&damaged)?, "a".repeat(100));

        let snapshot = fx.catalog.require(&report.pre_backup_id.expect("snapshot taken"))?;
        assert_eq!(snapshot.file_count, 1);
        Ok(())
    }

    #[test]
    fn test_overwrite_without_snapshot_is_allowed() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;
        fs::write(src.join("a.txt"), "local edit")?;

        let mut request = RestoreRequest::new(&outcome.backup_id);
        request.overwrite = true;
        request.pre_backup = Some(false);
        let report = engine(&fx).restore(&request)?;
        assert!(report.pre_backup_id.is_none());
        assert_eq!(fx.catalog.get_all()?.len(), 1);
        assert_eq!(fs::read_to_string(src.join("a.txt"))?, "a".repeat(100));
        Ok(())
    }

    #[test]
    fn test_selective_restore_and_missing_data_continue() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;
        let manifest = fx.store.read_manifest(&outcome.backup_id)?;

        let dest = fx.temp_dir.path().join("partial");
        let mut request = RestoreRequest::new(&outcome.backup_id);
        request.destination = Some(dest.clone());
        request.selective = vec![src.join("nested").to_string_lossy().into_owned()];
        let report = engine(&fx).restore(&request)?;
        assert_eq!(report.files_restored, 1);

        // One data file lost: the rest still restores
        let a = manifest.iter().find(|e| e.source_path.ends_with("a.txt")).unwrap();
        fs::remove_file(fx.store.data_path(&outcome.backup_id, &a.data_relative_path()))?;
        let dest = fx.temp_dir.path().join("lossy");
        let mut request = RestoreRequest::new(&outcome.backup_id);
        request.destination = Some(dest);
        let report = engine(&fx).restore(&request)?;
        assert_eq!(report.files_restored, 2);
        assert_eq!(report.failed.len(), 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_manifest_is_fatal() -> Result<()> {
        let fx = Fixture::new();
        let src = fx.source_tree();
        let outcome = fx.pipeline.create(fx.request(&src))?;
        fs::write(fx.store.manifest_path(&outcome.backup_id), "[]")?;

        let result = engine(&fx).restore(&RestoreRequest::new(&outcome.backup_id));
        assert!(matches!(result, Err(DrError::Integrity(_))));
        Ok(())
    }
}

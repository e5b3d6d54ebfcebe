//! Backup creation pipeline - Orchestrates one backup end to end.
//!
//! This module ties together:
//! - Source walking with exclude patterns
//! - Per-file checksums (computed while compressing, in one pass)
//! - zstd compression of captured bytes
//! - Incremental diff against the previous manifest (unchanged files are hard-linked)
//! - Atomic manifest/metadata publication and catalog registration

pub mod manifest;

use crate::catalog::{BackupCatalog, CatalogQuery};
use crate::config::BackupConfig;
use crate::fs::metadata::{same_mtime, FileMetadata};
use crate::fs::walker::{build_globset, walk_directory, FileInfo, WalkOptions};
use crate::integrity::{checksum_text, ChecksumReader};
use crate::models::{compression_ratio, BackupKind, BackupRecord, BackupStatus, FileError, RecordUpdate};
use crate::restore::verify::verify_backup;
use crate::store::ContentStore;
use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Utc};
use manifest::{data_subpath, index_by_source, Manifest, ManifestEntry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Parameters for one backup run
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupRequest {
    pub sources: Vec<String>,
    #[serde(default)]
    pub kind: BackupKind,
    #[serde(default)]
    pub label: Option<String>,
    /// Defaults to the configured setting
    #[serde(default)]
    pub compression: Option<bool>,
    #[serde(default)]
    pub compression_level: Option<i32>,
    /// Quick-verify right after creation; defaults to the configured setting
    #[serde(default)]
    pub verify: Option<bool>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl BackupRequest {
    pub fn new<S: Into<String>>(sources: impl IntoIterator<Item = S>) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Reject malformed input before anything touches the disk.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(DrError::InvalidArguments("at least one source is required".into()));
        }
        if self.sources.iter().any(|s| s.trim().is_empty()) {
            return Err(DrError::InvalidArguments("source paths must not be blank".into()));
        }
        if let Some(level) = self.compression_level {
            if !(1..=22).contains(&level) {
                return Err(DrError::InvalidArguments(format!(
                    "compression level must be between 1 and 22, got {level}"
                )));
            }
        }
        Ok(())
    }
}

/// Backup execution result
#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub backup_id: String,
    pub metadata: BackupRecord,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
}

/// Generate a lexically sortable, timestamp-derived backup id.
pub fn generate_backup_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("backup-{}-{}", now.format("%Y-%m-%dT%H-%M-%S-%3fZ"), &suffix[..6])
}

/// Expand a leading `~` and make relative roots absolute.
fn resolve_root(source: &str) -> io::Result<PathBuf> {
    let expanded = match source.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME is not set"))?;
            home.join(rest.trim_start_matches(['/', '\\']))
        }
        None => PathBuf::from(source),
    };
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

/// Previous backup an incremental run links unchanged files from.
struct Parent {
    id: String,
    manifest: Manifest,
}

/// Mutable state accumulated while capturing files
#[derive(Default)]
struct CaptureState {
    entries: Vec<ManifestEntry>,
    errors: Vec<FileError>,
    seen: HashSet<String>,
    /// Data paths already claimed in this backup
    stored: HashSet<String>,
    files_linked: u64,
}

/// Main backup pipeline
pub struct BackupPipeline {
    store: Arc<ContentStore>,
    catalog: Arc<BackupCatalog>,
    settings: BackupConfig,
}

impl BackupPipeline {
    pub fn new(store: Arc<ContentStore>, catalog: Arc<BackupCatalog>, settings: BackupConfig) -> Self {
        Self {
            store,
            catalog,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Execute one backup.
    ///
    /// Per-file problems never abort the run; they are recorded on the
    /// record and the backup is marked `partial`. Failing to publish the
    /// manifest, metadata or catalog entry is fatal and removes the
    /// half-built backup directory.
    pub fn create(&self, request: BackupRequest) -> Result<BackupOutcome> {
        request.validate()?;

        let mut exclude_patterns = self.settings.exclude_patterns.clone();
        exclude_patterns.extend(request.exclude_patterns.iter().cloned());
        // Compile once up front so a bad pattern fails before any I/O
        build_globset(&exclude_patterns)?;

        let start_time = Instant::now();
        let created_at = Utc::now();
        let backup_id = generate_backup_id(created_at);
        let compression = request.compression.unwrap_or(self.settings.compression);
        let level = request
            .compression_level
            .unwrap_or(self.settings.compression_level);
        let verify_after = request.verify.unwrap_or(self.settings.verify_after_create);

        info!(
            backup_id = %backup_id,
            kind = %request.kind,
            sources = ?request.sources,
            compression,
            "Starting backup"
        );

        self.store.create_backup_dirs(&backup_id)?;

        let parent = match request.kind {
            BackupKind::Incremental => self.find_parent(&request.sources),
            BackupKind::Full => None,
        };
        let parent_index: HashMap<&str, &ManifestEntry> = parent
            .as_ref()
            .map(|p| index_by_source(&p.manifest))
            .unwrap_or_default();

        let walk_options = WalkOptions {
            follow_links: self.settings.follow_links,
            max_depth: None,
            exclude_patterns,
        };

        let mut state = CaptureState::default();
        for source in &request.sources {
            self.capture_source(
                &backup_id,
                source,
                &walk_options,
                compression,
                level,
                parent.as_ref().map(|p| (p.id.as_str(), &parent_index)),
                &mut state,
            )?;
        }

        let result = self.finalize(
            &backup_id,
            created_at,
            &request,
            compression,
            parent.as_ref().map(|p| p.id.clone()),
            state,
            start_time,
        );

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(backup_id = %backup_id, error = %e, "Backup could not be published, removing it");
                let _ = self.store.delete_backup(&backup_id);
                return Err(e);
            }
        };

        if verify_after {
            self.verify_after_create(&mut outcome);
        }

        info!(
            backup_id = %backup_id,
            files = outcome.metadata.file_count,
            total_bytes = outcome.metadata.total_size,
            stored_bytes = outcome.metadata.compressed_size,
            linked = outcome.metadata.files_linked,
            status = ?outcome.metadata.status,
            duration_ms = outcome.duration_ms,
            "Backup completed"
        );

        Ok(outcome)
    }

    /// Quick-verify a freshly published backup.
    ///
    /// A failed check keeps the backup but flags it: the record is
    /// downgraded to `partial` with the failure in its errors, both in the
    /// catalog and in `metadata.json`.
    fn verify_after_create(&self, outcome: &mut BackupOutcome) {
        let backup_id = outcome.backup_id.clone();
        let failure = match verify_backup(&self.store, &outcome.metadata, true) {
            Ok(report) if report.valid => {
                debug!(backup_id = %backup_id, "Post-create verification passed");
                return;
            }
            Ok(report) => {
                warn!(
                    backup_id = %backup_id,
                    files_invalid = report.files_invalid,
                    "Post-create verification failed"
                );
                format!(
                    "verification failed: {} invalid file(s), manifest checksum {}",
                    report.files_invalid,
                    if report.checksum_valid { "valid" } else { "invalid" }
                )
            }
            Err(e) => {
                warn!(backup_id = %backup_id, error = %e, "Post-create verification could not run");
                format!("verification could not run: {e}")
            }
        };
        outcome.warnings.push(failure.clone());

        let mut errors = outcome.metadata.errors.clone();
        errors.push(FileError::error("verification", failure));
        let status = match outcome.metadata.status {
            BackupStatus::Failed => BackupStatus::Failed,
            _ => BackupStatus::Partial,
        };
        let update = RecordUpdate {
            status: Some(status),
            errors: Some(errors),
            ..RecordUpdate::default()
        };

        match self.catalog.update(&backup_id, update) {
            Ok(record) => {
                if let Err(e) = self.store.write_metadata(&record) {
                    warn!(backup_id = %backup_id, error = %e, "Failed to rewrite metadata after verification");
                }
                outcome.metadata = record;
            }
            Err(e) => warn!(backup_id = %backup_id, error = %e, "Failed to flag unverified backup"),
        }
    }

    /// Most recent usable backup sharing a source root with this request.
    fn find_parent(&self, sources: &[String]) -> Option<Parent> {
        let candidates = match self.catalog.query(&CatalogQuery::default()) {
            Ok(records) => records,
            Err(e) => {
                warn!("Catalog unavailable for incremental diff, capturing everything: {}", e);
                return None;
            }
        };

        let record = candidates.into_iter().find(|r| {
            r.status != BackupStatus::Failed && sources.iter().any(|s| r.has_source(s))
        })?;

        match self.store.read_manifest(&record.id) {
            Ok(manifest) => {
                info!(parent_id = %record.id, files = manifest.len(), "Incremental diff against previous backup");
                Some(Parent {
                    id: record.id,
                    manifest,
                })
            }
            Err(e) => {
                warn!(parent_id = %record.id, error = %e, "Previous manifest unreadable, falling back to full capture");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn capture_source(
        &self,
        backup_id: &str,
        source: &str,
        walk_options: &WalkOptions,
        compression: bool,
        level: i32,
        parent: Option<(&str, &HashMap<&str, &ManifestEntry>)>,
        state: &mut CaptureState,
    ) -> Result<()> {
        let root = match resolve_root(source) {
            Ok(root) => root,
            Err(e) => {
                state.errors.push(FileError::warning(source, e));
                return Ok(());
            }
        };

        let walked = walk_directory(&root, walk_options)?;
        info!(source = %source, files = walked.files.len(), warnings = walked.warnings.len(), "Scanned source");

        for warning in walked.warnings {
            warn!("Skipping {}: {}", warning.path.display(), warning.message);
            state
                .errors
                .push(FileError::warning(warning.path.display().to_string(), warning.message));
        }

        for file in walked.files {
            let source_path = file.path.to_string_lossy().into_owned();
            if !state.seen.insert(source_path.clone()) {
                continue; // Overlapping source roots
            }

            let captured = if source.starts_with('~') {
                Path::new(source).join(&file.relative_path).to_string_lossy().into_owned()
            } else {
                source_path.clone()
            };
            let rel = data_subpath(&captured);
            if !state.stored.insert(rel.clone()) {
                warn!("Skipping {}: data path {} already taken", file.path.display(), rel);
                state.errors.push(FileError::error(
                    source_path,
                    format!("data path '{rel}' already used by another captured file"),
                ));
                continue;
            }

            let previous = parent.and_then(|(parent_id, index)| {
                index.get(source_path.as_str()).map(|entry| (parent_id, *entry))
            });

            match self.capture_file(backup_id, &file, &source_path, &rel, compression, level, previous) {
                Ok((entry, linked)) => {
                    if linked {
                        state.files_linked += 1;
                    }
                    state.entries.push(entry);
                }
                Err(e) => {
                    warn!("Failed to capture {}: {}", file.path.display(), e);
                    state.errors.push(FileError::error(source_path, e));
                }
            }
        }

        Ok(())
    }

    /// Capture one file, returning its manifest entry and whether it was hard-linked.
    #[allow(clippy::too_many_arguments)]
    fn capture_file(
        &self,
        backup_id: &str,
        file: &FileInfo,
        source_path: &str,
        rel: &str,
        compression: bool,
        level: i32,
        previous: Option<(&str, &ManifestEntry)>,
    ) -> Result<(ManifestEntry, bool)> {
        let metadata = FileMetadata::from_path(&file.path)?;

        if let Some((parent_id, entry)) = previous {
            if entry.size == metadata.size && same_mtime(entry.modified, metadata.modified) {
                match self.link_from_parent(backup_id, parent_id, entry, rel) {
                    Ok(linked) => return Ok((linked, true)),
                    Err(e) => debug!("Hard link from {} failed ({}), capturing {}", parent_id, e, source_path),
                }
            }
        }

        let raw_path = self.store.data_path(backup_id, rel);
        if let Some(parent_dir) = raw_path.parent() {
            fs::create_dir_all(parent_dir)?;
        }

        if compression {
            match write_compressed(&file.path, &raw_path, level) {
                Ok((checksum, size, stored)) if stored <= size => {
                    return Ok((
                        ManifestEntry {
                            path: rel.to_string(),
                            source_path: source_path.to_string(),
                            size,
                            stored_size: Some(stored),
                            checksum,
                            modified: metadata.modified,
                            compressed: true,
                            mode: metadata.permissions,
                        },
                        false,
                    ));
                }
                // Incompressible: rewritten raw below so stored never exceeds original
                Ok(_) => {}
                Err(e) => {
                    let _ = fs::remove_file(&raw_path);
                    return Err(e.into());
                }
            }
        }

        match write_raw(&file.path, &raw_path) {
            Ok((checksum, size)) => Ok((
                ManifestEntry {
                    path: rel.to_string(),
                    source_path: source_path.to_string(),
                    size,
                    stored_size: Some(size),
                    checksum,
                    modified: metadata.modified,
                    compressed: false,
                    mode: metadata.permissions,
                },
                false,
            )),
            Err(e) => {
                let _ = fs::remove_file(&raw_path);
                Err(e.into())
            }
        }
    }

    fn link_from_parent(
        &self,
        backup_id: &str,
        parent_id: &str,
        entry: &ManifestEntry,
        rel: &str,
    ) -> Result<ManifestEntry> {
        let mut linked = entry.clone();
        linked.path = rel.to_string();

        let from = self.store.data_path(parent_id, &entry.data_relative_path());
        let to = self.store.data_path(backup_id, &linked.data_relative_path());
        if let Some(parent_dir) = to.parent() {
            fs::create_dir_all(parent_dir)?;
        }
        fs::hard_link(&from, &to)?;
        Ok(linked)
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        backup_id: &str,
        created_at: DateTime<Utc>,
        request: &BackupRequest,
        compression: bool,
        parent_id: Option<String>,
        state: CaptureState,
        start_time: Instant,
    ) -> Result<BackupOutcome> {
        let manifest_text = self.store.write_manifest(backup_id, &state.entries)?;
        let manifest_checksum = checksum_text(&manifest_text);

        let total_size: u64 = state.entries.iter().map(|e| e.size).sum();
        let compressed_size: u64 = state.entries.iter().map(ManifestEntry::stored_size).sum();

        let status = if state.errors.is_empty() {
            BackupStatus::Success
        } else if state.entries.is_empty() {
            BackupStatus::Failed
        } else {
            BackupStatus::Partial
        };

        let warnings: Vec<String> = state.errors.iter().map(ToString::to_string).collect();
        let duration_ms = start_time.elapsed().as_millis() as u64;

        let record = BackupRecord {
            id: backup_id.to_string(),
            kind: request.kind,
            created_at,
            sources: request.sources.clone(),
            label: request.label.clone(),
            file_count: state.entries.len() as u64,
            total_size,
            compressed_size,
            compression_ratio: compression_ratio(total_size, compressed_size),
            compression,
            manifest_checksum,
            status,
            errors: state.errors,
            parent_id: parent_id.filter(|_| state.files_linked > 0),
            files_linked: state.files_linked,
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
            duration_ms,
        };

        self.store.write_metadata(&record)?;
        self.catalog.add(record.clone())?;

        Ok(BackupOutcome {
            backup_id: backup_id.to_string(),
            metadata: record,
            duration_ms,
            warnings,
        })
    }
}

/// Stream `source` through the checksum and the zstd encoder into `dest`.
/// Returns (checksum, original size, stored size).
fn write_compressed(source: &Path, dest: &Path, level: i32) -> io::Result<(String, u64, u64)> {
    let mut reader = ChecksumReader::new(BufReader::new(File::open(source)?));
    let out = BufWriter::new(File::create(dest)?);
    let mut encoder = zstd::stream::write::Encoder::new(out, level)?;
    io::copy(&mut reader, &mut encoder)?;
    let mut out = encoder.finish()?;
    out.flush()?;
    drop(out);

    let (checksum, size) = reader.finish();
    let stored = fs::metadata(dest)?.len();
    Ok((checksum, size, stored))
}

/// Copy `source` into `dest` unchanged. Returns (checksum, size).
fn write_raw(source: &Path, dest: &Path) -> io::Result<(String, u64)> {
    let mut reader = ChecksumReader::new(BufReader::new(File::open(source)?));
    let mut out = BufWriter::new(File::create(dest)?);
    io::copy(&mut reader, &mut out)?;
    out.flush()?;
    Ok(reader.finish())
}

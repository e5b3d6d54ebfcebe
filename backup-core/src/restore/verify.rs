//! Backup verification.
//!
//! A quick check confirms the manifest checksum and that every data file is
//! present with its recorded stored size. A full check additionally streams
//! every data file through the decoder and compares content checksums.
//! Mismatches are reported, never repaired.

use crate::executor::manifest::{Manifest, ManifestEntry};
use crate::integrity::{checksum, checksum_text};
use crate::models::BackupRecord;
use crate::store::ContentStore;
use crate::utils::errors::{DrError, Result};
use serde::Serialize;
use std::io::{self, BufReader};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VerifyIssue {
    pub path: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl VerifyIssue {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
            expected: None,
            actual: None,
        }
    }

    fn mismatch(path: impl Into<String>, reason: impl Into<String>, expected: String, actual: String) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
            expected: Some(expected),
            actual: Some(actual),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub backup_id: String,
    pub quick: bool,
    pub valid: bool,
    pub checksum_valid: bool,
    pub files_verified: u64,
    pub files_invalid: u64,
    pub errors: Vec<VerifyIssue>,
}

impl VerifyReport {
    fn invalid(backup_id: &str, quick: bool, issue: VerifyIssue) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            quick,
            valid: false,
            checksum_valid: false,
            files_verified: 0,
            files_invalid: 0,
            errors: vec![issue],
        }
    }
}

/// Verify a catalogued backup against its stored manifest and data.
///
/// Only an I/O failure reading the manifest itself is an `Err`; a missing
/// or corrupt manifest is an invalid report.
pub fn verify_backup(store: &ContentStore, record: &BackupRecord, quick: bool) -> Result<VerifyReport> {
    let id = record.id.as_str();

    let manifest_text = match store.read_manifest_text(id) {
        Ok(text) => text,
        Err(DrError::NotFound(_)) => {
            warn!(backup_id = %id, "Manifest missing");
            return Ok(VerifyReport::invalid(id, quick, VerifyIssue::new("manifest.json", "manifest missing")));
        }
        Err(e) => return Err(e),
    };

    let actual = checksum_text(&manifest_text);
    let checksum_valid = actual.eq_ignore_ascii_case(&record.manifest_checksum);
    let mut errors = Vec::new();
    if !checksum_valid {
        errors.push(VerifyIssue::mismatch(
            "manifest.json",
            "manifest checksum mismatch",
            record.manifest_checksum.clone(),
            actual,
        ));
    }

    let manifest: Manifest = match serde_json::from_str(&manifest_text) {
        Ok(manifest) => manifest,
        Err(e) => {
            errors.push(VerifyIssue::new("manifest.json", format!("manifest unreadable: {e}")));
            return Ok(VerifyReport {
                backup_id: id.to_string(),
                quick,
                valid: false,
                checksum_valid,
                files_verified: 0,
                files_invalid: 0,
                errors,
            });
        }
    };

    let mut files_verified = 0u64;
    let mut files_invalid = 0u64;
    for entry in &manifest {
        let issue = if quick {
            quick_check(store, id, entry)
        } else {
            full_check(store, id, entry)
        };
        match issue {
            None => files_verified += 1,
            Some(issue) => {
                files_invalid += 1;
                errors.push(issue);
            }
        }
    }

    let valid = checksum_valid && files_invalid == 0;
    info!(
        backup_id = %id,
        quick,
        valid,
        files_verified,
        files_invalid,
        "Verification finished"
    );

    Ok(VerifyReport {
        backup_id: id.to_string(),
        quick,
        valid,
        checksum_valid,
        files_verified,
        files_invalid,
        errors,
    })
}

fn quick_check(store: &ContentStore, id: &str, entry: &ManifestEntry) -> Option<VerifyIssue> {
    let path = store.data_path(id, &entry.data_relative_path());
    match store.stat(&path) {
        Ok(stat) if stat.size == entry.stored_size() => None,
        Ok(stat) => Some(VerifyIssue::mismatch(
            &entry.path,
            "stored size mismatch",
            entry.stored_size().to_string(),
            stat.size.to_string(),
        )),
        Err(DrError::NotFound(_)) => Some(VerifyIssue::new(&entry.path, "data file missing")),
        Err(e) => Some(VerifyIssue::new(&entry.path, e.to_string())),
    }
}

fn full_check(store: &ContentStore, id: &str, entry: &ManifestEntry) -> Option<VerifyIssue> {
    let file = match store.open_data(id, &entry.data_relative_path()) {
        Ok(file) => file,
        Err(DrError::NotFound(_)) => return Some(VerifyIssue::new(&entry.path, "data file missing")),
        Err(e) => return Some(VerifyIssue::new(&entry.path, e.to_string())),
    };

    let digest: io::Result<String> = if entry.compressed {
        zstd::stream::read::Decoder::new(file).and_then(checksum)
    } else {
        checksum(BufReader::new(file))
    };

    match digest {
        Ok(actual) if actual.eq_ignore_ascii_case(&entry.checksum) => None,
        Ok(actual) => Some(VerifyIssue::mismatch(
            &entry.path,
            "content checksum mismatch",
            entry.checksum.clone(),
            actual,
        )),
        Err(e) => Some(VerifyIssue::new(&entry.path, format!("unreadable: {e}"))),
    }
}

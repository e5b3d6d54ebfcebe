use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::errors::DrError;

// ── BackupKind ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    #[default]
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = DrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            other => Err(DrError::InvalidArguments(format!(
                "unknown backup kind '{other}' (expected full or incremental)"
            ))),
        }
    }
}

// ── BackupStatus ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Success,
    Partial,
    Failed,
}

// ── FileError ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A per-file problem recorded while capturing a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileError {
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

impl FileError {
    pub fn warning(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            message: message.to_string(),
            severity: Severity::Warning,
        }
    }

    pub fn error(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            message: message.to_string(),
            severity: Severity::Error,
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

// ── BackupRecord ──

/// Catalog-level summary of one backup. Also written as `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub file_count: u64,
    pub total_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: u32,
    #[serde(default)]
    pub compression: bool,
    pub manifest_checksum: String,
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FileError>,
    /// Backup an incremental run hard-linked unchanged files from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub files_linked: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl BackupRecord {
    pub fn has_source(&self, source: &str) -> bool {
        let wanted = source.trim_end_matches('/');
        self.sources
            .iter()
            .any(|s| s.trim_end_matches('/') == wanted)
    }

    /// Age in whole days at `now`; records stamped in the future count as age 0.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }
}

/// `round((total - stored) / total * 100)`, 0 when nothing was captured.
pub fn compression_ratio(total_size: u64, stored_size: u64) -> u32 {
    if total_size == 0 || stored_size >= total_size {
        return 0;
    }
    let saved = (total_size - stored_size) as f64;
    ((saved / total_size as f64) * 100.0).round() as u32
}

/// Partial update applied through `BackupCatalog::update`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordUpdate {
    pub label: Option<Option<String>>,
    pub status: Option<BackupStatus>,
    pub errors: Option<Vec<FileError>>,
    pub manifest_checksum: Option<String>,
}

impl RecordUpdate {
    pub fn apply_to(self, record: &mut BackupRecord) {
        if let Some(label) = self.label {
            record.label = label;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(errors) = self.errors {
            record.errors = errors;
        }
        if let Some(checksum) = self.manifest_checksum {
            record.manifest_checksum = checksum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(0, 0), 0);
        assert_eq!(compression_ratio(300, 45), 85);
        assert_eq!(compression_ratio(1000, 1000), 0);
        assert_eq!(compression_ratio(1000, 1200), 0);
        assert_eq!(compression_ratio(3, 1), 67);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("full".parse::<BackupKind>().unwrap(), BackupKind::Full);
        assert_eq!(BackupKind::default(), BackupKind::Incremental);
        assert!("differential".parse::<BackupKind>().is_err());
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&BackupKind::Incremental).unwrap();
        assert_eq!(json, "\"incremental\"");
        let status: BackupStatus = serde_json::from_str("\"partial\"").unwrap();
        assert_eq!(status, BackupStatus::Partial);
    }

    #[test]
    fn test_age_days() {
        let now = Utc::now();
        let record = BackupRecord {
            id: "backup-test".into(),
            kind: BackupKind::Full,
            created_at: now - Duration::hours(49),
            sources: vec!["/data/".into()],
            label: None,
            file_count: 0,
            total_size: 0,
            compressed_size: 0,
            compression_ratio: 0,
            compression: false,
            manifest_checksum: String::new(),
            status: BackupStatus::Success,
            errors: vec![],
            parent_id: None,
            files_linked: 0,
            hostname: None,
            duration_ms: 0,
        };
        assert_eq!(record.age_days(now), 2);
        assert!(record.has_source("/data"));
        assert!(!record.has_source("/etc"));
    }
}

//! Durable index of every backup record.
//!
//! The catalog is a single JSON document (`index.json`) rewritten through
//! [`atomic_write`] on every mutation. Statistics are recomputed from the full
//! record set on each call, so there are no counters to drift.
//!
//! Mutations are serialized inside one process by `write_lock`. Two processes
//! mutating the same index concurrently can still lose an update; callers
//! must run at most one mutating operation per backup root at a time.

use crate::models::{BackupKind, BackupRecord, RecordUpdate};
use crate::store::atomic_write;
use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    #[serde(default)]
    backups: Vec<BackupRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter, sort and limit applied by [`BackupCatalog::query`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogQuery {
    pub kind: Option<BackupKind>,
    pub source: Option<String>,
    pub label: Option<String>,
    /// Inclusive lower bound on `created_at`
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl CatalogQuery {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    fn matches(&self, record: &BackupRecord) -> bool {
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if !record.has_source(source) {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if record.label.as_deref() != Some(label.as_str()) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.created_at > to {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct CatalogStatistics {
    pub total_backups: usize,
    pub total_size: u64,
    pub total_compressed_size: u64,
    pub full_backups: usize,
    pub incremental_backups: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl CatalogStatistics {
    pub fn from_records(records: &[BackupRecord]) -> Self {
        let mut stats = CatalogStatistics {
            total_backups: records.len(),
            ..Self::default()
        };
        for record in records {
            stats.total_size += record.total_size;
            stats.total_compressed_size += record.compressed_size;
            match record.kind {
                BackupKind::Full => stats.full_backups += 1,
                BackupKind::Incremental => stats.incremental_backups += 1,
            }
            stats.oldest = Some(stats.oldest.map_or(record.created_at, |o| o.min(record.created_at)));
            stats.newest = Some(stats.newest.map_or(record.created_at, |n| n.max(record.created_at)));
        }
        stats
    }
}

pub struct BackupCatalog {
    index_path: PathBuf,
    write_lock: Mutex<()>,
}

impl BackupCatalog {
    pub fn new(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Register a new record. Ids are unique.
    pub fn add(&self, record: BackupRecord) -> Result<()> {
        self.mutate(|records| {
            if records.iter().any(|r| r.id == record.id) {
                return Err(DrError::InvalidArguments(format!(
                    "backup '{}' is already in the catalog",
                    record.id
                )));
            }
            records.push(record);
            Ok(())
        })
    }

    pub fn update(&self, id: &str, update: RecordUpdate) -> Result<BackupRecord> {
        self.mutate(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| DrError::NotFound(format!("backup '{id}'")))?;
            update.apply_to(record);
            Ok(record.clone())
        })
    }

    /// Remove a record, returning whether it was present.
    pub fn remove(&self, id: &str) -> Result<bool> {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            Ok(records.len() != before)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.load()?.into_iter().find(|r| r.id == id))
    }

    /// Like [`get`](Self::get) but a missing id is an error.
    pub fn require(&self, id: &str) -> Result<BackupRecord> {
        self.get(id)?
            .ok_or_else(|| DrError::NotFound(format!("backup '{id}'")))
    }

    pub fn get_all(&self) -> Result<Vec<BackupRecord>> {
        self.load()
    }

    pub fn query(&self, query: &CatalogQuery) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .load()?
            .into_iter()
            .filter(|r| query.matches(r))
            .collect();

        match query.sort {
            SortKey::CreatedAt => records.sort_by(|a, b| {
                a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
            }),
            SortKey::Size => records.sort_by(|a, b| {
                a.total_size.cmp(&b.total_size).then_with(|| a.id.cmp(&b.id))
            }),
        }
        if query.order == SortOrder::Desc {
            records.reverse();
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    pub fn statistics(&self) -> Result<CatalogStatistics> {
        Ok(CatalogStatistics::from_records(&self.load()?))
    }

    /// Load every record; a missing index is an empty catalog.
    fn load(&self) -> Result<Vec<BackupRecord>> {
        let text = match std::fs::read_to_string(&self.index_path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let index: IndexFile = serde_json::from_str(&text)?;
        Ok(index.backups)
    }

    fn save(&self, records: Vec<BackupRecord>) -> Result<()> {
        let index = IndexFile {
            version: INDEX_VERSION,
            backups: records,
        };
        let text = serde_json::to_string_pretty(&index)?;
        atomic_write(&self.index_path, text.as_bytes())?;
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<BackupRecord>) -> Result<T>) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| DrError::Task("catalog write lock poisoned".into()))?;
        let mut records = self.load()?;
        let out = f(&mut records)?;
        self.save(records)?;
        Ok(out)
    }
}

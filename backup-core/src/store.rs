//! On-disk layout for backups and the atomic write primitive.
//!
//! ```text
//! <root>/<backup_id>/data/...        captured (possibly compressed) file bytes
//! <root>/<backup_id>/manifest.json   serialized manifest entries
//! <root>/<backup_id>/metadata.json   serialized backup record
//! ```
//!
//! Manifest and metadata are only ever published through [`atomic_write`], so
//! a reader sees either the previous file or the complete new one.

use crate::executor::manifest::{join_manifest_path, Manifest};
use crate::models::BackupRecord;
use crate::utils::errors::{DrError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const DATA_DIR: &str = "data";
const MANIFEST_FILE: &str = "manifest.json";
const METADATA_FILE: &str = "metadata.json";

/// Write `bytes` to `path` via a temporary sibling and a rename.
///
/// On failure the temporary file is removed and `path` is left untouched.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp_path = parent.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4().simple()));

    let result = write_and_publish(&tmp_path, path, bytes);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_and_publish(tmp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    match fs::rename(tmp_path, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // Rename can fail across devices; fall back to copy-then-remove
            tracing::debug!(
                "rename {} -> {} failed ({}), copying instead",
                tmp_path.display(),
                path.display(),
                rename_err
            );
            fs::copy(tmp_path, path)?;
            fs::remove_file(tmp_path)?;
            Ok(())
        }
    }
}

/// Size and modification time of a stored file.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<std::time::SystemTime>,
}

/// Deterministic path layout rooted at the backup directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn data_dir(&self, id: &str) -> PathBuf {
        self.backup_dir(id).join(DATA_DIR)
    }

    /// Location of a stored data file, given its data-relative path.
    pub fn data_path(&self, id: &str, relative: &str) -> PathBuf {
        join_manifest_path(&self.data_dir(id), relative)
    }

    pub fn manifest_path(&self, id: &str) -> PathBuf {
        self.backup_dir(id).join(MANIFEST_FILE)
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.backup_dir(id).join(METADATA_FILE)
    }

    /// Create `<root>/<id>/data/`.
    pub fn create_backup_dirs(&self, id: &str) -> Result<PathBuf> {
        let data_dir = self.data_dir(id);
        fs::create_dir_all(&data_dir)?;
        Ok(data_dir)
    }

    /// Serialize and atomically publish the manifest, returning the exact text written.
    pub fn write_manifest(&self, id: &str, manifest: &Manifest) -> Result<String> {
        let text = serde_json::to_string_pretty(manifest)?;
        atomic_write(&self.manifest_path(id), text.as_bytes())?;
        Ok(text)
    }

    /// Raw manifest text, as needed for checksum verification.
    pub fn read_manifest_text(&self, id: &str) -> Result<String> {
        self.ensure_exists(id)?;
        let path = self.manifest_path(id);
        fs::read_to_string(&path).map_err(|e| not_found_or_io(e, &path))
    }

    pub fn read_manifest(&self, id: &str) -> Result<Manifest> {
        let text = self.read_manifest_text(id)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write_metadata(&self, record: &BackupRecord) -> Result<()> {
        let text = serde_json::to_string_pretty(record)?;
        atomic_write(&self.metadata_path(&record.id), text.as_bytes())?;
        Ok(())
    }

    pub fn read_metadata(&self, id: &str) -> Result<BackupRecord> {
        self.ensure_exists(id)?;
        let path = self.metadata_path(id);
        let text = fs::read_to_string(&path).map_err(|e| not_found_or_io(e, &path))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// True when the backup directory exists.
    pub fn exists(&self, id: &str) -> bool {
        self.backup_dir(id).is_dir()
    }

    /// True when both manifest and metadata are present.
    pub fn is_complete(&self, id: &str) -> bool {
        self.manifest_path(id).is_file() && self.metadata_path(id).is_file()
    }

    /// Recursively delete a backup directory.
    pub fn delete_backup(&self, id: &str) -> Result<()> {
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(DrError::InvalidArguments(format!("invalid backup id '{id}'")));
        }
        let dir = self.backup_dir(id);
        fs::remove_dir_all(&dir).map_err(|e| not_found_or_io(e, &dir))
    }

    pub fn stat(&self, path: &Path) -> Result<FileStat> {
        let metadata = fs::metadata(path).map_err(|e| not_found_or_io(e, path))?;
        Ok(FileStat {
            size: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }

    /// Open a stored data file for reading.
    pub fn open_data(&self, id: &str, relative: &str) -> Result<File> {
        let path = self.data_path(id, relative);
        File::open(&path).map_err(|e| not_found_or_io(e, &path))
    }

    /// Names of every backup directory under the root; an absent root is empty.
    pub fn list_backup_dirs(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn ensure_exists(&self, id: &str) -> Result<()> {
        if self.exists(id) {
            Ok(())
        } else {
            Err(DrError::NotFound(format!("backup directory for '{id}'")))
        }
    }
}

fn not_found_or_io(e: io::Error, path: &Path) -> DrError {
    if e.kind() == io::ErrorKind::NotFound {
        DrError::NotFound(path.display().to_string())
    } else {
        DrError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::ManifestEntry;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let store = ContentStore::new("/backups");
        assert_eq!(store.data_dir("b1"), PathBuf::from("/backups/b1/data"));
        assert_eq!(store.manifest_path("b1"), PathBuf::from("/backups/b1/manifest.json"));
        assert_eq!(store.metadata_path("b1"), PathBuf::from("/backups/b1/metadata.json"));
        assert_eq!(
            store.data_path("b1", "var/log/a.log.zst"),
            PathBuf::from("/backups/b1/data/var/log/a.log.zst")
        );
    }

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_temp() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("index.json");

        atomic_write(&path, b"first")?;
        atomic_write(&path, b"second")?;

        assert_eq!(fs::read(&path)?, b"second");
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_write_keeps_old_file() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("metadata.json");
        atomic_write(&path, b"stable")?;

        // A directory squatting on the canonical name makes publish fail
        let blocked = temp_dir.path().join("blocked");
        fs::create_dir_all(blocked.join("child"))?;
        assert!(atomic_write(&blocked, b"new").is_err());

        assert_eq!(fs::read(&path)?, b"stable");
        Ok(())
    }

    #[test]
    fn test_manifest_round_trip_and_missing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ContentStore::new(temp_dir.path());

        assert!(matches!(store.read_manifest("nope"), Err(DrError::NotFound(_))));

        store.create_backup_dirs("b1")?;
        let manifest = vec![ManifestEntry {
            path: "a.txt".into(),
            source_path: "/a.txt".into(),
            size: 1,
            stored_size: None,
            checksum: "ab".into(),
            modified: Utc::now(),
            compressed: false,
            mode: None,
        }];
        let text = store.write_manifest("b1", &manifest)?;
        assert_eq!(store.read_manifest_text("b1")?, text);
        assert_eq!(store.read_manifest("b1")?, manifest);
        assert!(!store.is_complete("b1"));
        Ok(())
    }

    #[test]
    fn test_delete_and_list() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ContentStore::new(temp_dir.path());
        store.create_backup_dirs("b2")?;
        store.create_backup_dirs("b1")?;

        assert_eq!(store.list_backup_dirs()?, vec!["b1".to_string(), "b2".to_string()]);
        store.delete_backup("b1")?;
        assert!(!store.exists("b1"));
        assert!(matches!(store.delete_backup("b1"), Err(DrError::NotFound(_))));
        assert!(store.delete_backup("../etc").is_err());
        Ok(())
    }
}

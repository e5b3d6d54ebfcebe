//! Manifest types.
//!
//! A manifest is the ordered list of files captured by one backup, with the
//! checksum of each file's original content. It is serialized as
//! `manifest.json` in the backup directory and its own checksum is stored in
//! the backup record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Data sub-directory standing in for a leading `~`.
const HOME_SUBPATH: &str = "_home";

/// Metadata for a single captured file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path under the backup's data directory (always relative, `/`-separated)
    pub path: String,
    /// Absolute location the file was captured from
    pub source_path: String,
    /// Original size in bytes
    pub size: u64,
    /// Bytes on disk in the data directory; absent means "same as `size`"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_size: Option<u64>,
    /// Checksum of the original (uncompressed) content
    pub checksum: String,
    /// Source modification time at capture
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl ManifestEntry {
    /// Stored size with the default-resolution rule applied.
    pub fn stored_size(&self) -> u64 {
        self.stored_size.unwrap_or(self.size)
    }

    /// File name of the stored bytes relative to the data directory.
    ///
    /// Compressed and raw bytes share one name per entry; only the
    /// `compressed` flag tells them apart, so no two entries can alias.
    pub fn data_relative_path(&self) -> String {
        self.path.clone()
    }
}

pub type Manifest = Vec<ManifestEntry>;

/// Index entries by source path, for the incremental diff.
pub fn index_by_source(manifest: &[ManifestEntry]) -> HashMap<&str, &ManifestEntry> {
    manifest
        .iter()
        .map(|entry| (entry.source_path.as_str(), entry))
        .collect()
}

/// Translate a captured path into its location under the data directory.
///
/// Leading `/` (and any Windows prefix) is dropped, a leading `~` becomes
/// `_home`, and `.`/`..` components are discarded so an entry can never
/// escape the data directory.
pub fn data_subpath(captured: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let (rest, home) = match captured.strip_prefix('~') {
        Some(rest) => (rest, true),
        None => (captured, false),
    };
    if home {
        parts.push(HOME_SUBPATH.to_string());
    }

    for component in Path::new(rest).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                // Never climb above the data root
                if parts.len() > usize::from(home) {
                    parts.pop();
                }
            }
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
        }
    }

    parts.join("/")
}

/// Join a `/`-separated manifest path onto `base` component by component.
pub fn join_manifest_path(base: &Path, manifest_path: &str) -> PathBuf {
    manifest_path
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .fold(base.to_path_buf(), |acc, part| acc.join(part))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, compressed: bool, stored_size: Option<u64>) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            source_path: format!("/{path}"),
            size: 100,
            stored_size,
            checksum: "00".into(),
            modified: Utc::now(),
            compressed,
            mode: None,
        }
    }

    #[test]
    fn test_data_subpath_translation() {
        assert_eq!(data_subpath("/var/log/app.log"), "var/log/app.log");
        assert_eq!(data_subpath("~/notes/todo.md"), "_home/notes/todo.md");
        assert_eq!(data_subpath("relative/file"), "relative/file");
        assert_eq!(data_subpath("/a/../../etc/passwd"), "etc/passwd");
        assert_eq!(data_subpath("~/../x"), "_home/x");
    }

    #[test]
    fn test_stored_size_defaults_to_size() {
        assert_eq!(entry("a", false, None).stored_size(), 100);
        assert_eq!(entry("a", true, Some(12)).stored_size(), 12);
    }

    #[test]
    fn test_data_relative_path() {
        assert_eq!(entry("dir/a.txt", true, Some(5)).data_relative_path(), "dir/a.txt");
        assert_eq!(entry("dir/a.txt", false, None).data_relative_path(), "dir/a.txt");
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let json = r#"{"path":"a","source_path":"/a","size":3,"checksum":"ff","modified":"2026-01-01T00:00:00Z"}"#;
        let parsed: ManifestEntry = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.stored_size(), 3);
        assert!(!parsed.compressed);
    }

    #[test]
    fn test_join_manifest_path() {
        let joined = join_manifest_path(Path::new("/restore"), "var/../log/x");
        assert_eq!(joined, PathBuf::from("/restore/var/log/x"));
    }
}

//! Directory traversal for backup sources.
//!
//! Walks one source root, pruning excluded directories and reporting
//! unreadable entries as warnings instead of aborting the walk.

use crate::utils::errors::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Exclude patterns (glob-style), matched against the entry's file name
    /// and its path relative to the root
    pub exclude_patterns: Vec<String>,
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// For symlinks, resolves to the target to get the real file size.
    /// Returns None if the symlink target is a directory or cannot be resolved.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata().map_err(std::io::Error::from)?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = raw_metadata.is_symlink();

        let size = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved.len(),
                // Symlink to directory or broken symlink
                _ => return Ok(None),
            }
        } else if raw_metadata.is_file() {
            raw_metadata.len()
        } else {
            // Sockets, fifos, devices
            return Ok(None);
        };

        Ok(Some(Self {
            path,
            relative_path,
            size,
            is_symlink,
        }))
    }
}

/// A path the walker could not read.
#[derive(Debug, Clone)]
pub struct WalkWarning {
    pub path: PathBuf,
    pub message: String,
}

/// Result of walking one root
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub files: Vec<FileInfo>,
    pub warnings: Vec<WalkWarning>,
}

/// Compile exclude patterns. Returns `None` when there is nothing to exclude.
pub fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }

    Ok(Some(builder.build()?))
}

/// Walk a directory tree (or a single file) and collect all regular files.
///
/// Only an invalid exclude pattern is an error; everything else that goes
/// wrong is reported per path in [`WalkOutcome::warnings`].
///
/// # Example
/// ```no_run
/// use backup_core::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let outcome = walk_directory(Path::new("/data"), &WalkOptions::default()).unwrap();
/// println!("Found {} files", outcome.files.len());
/// ```
pub fn walk_directory(root: &Path, options: &WalkOptions) -> Result<WalkOutcome> {
    let excludes = build_globset(&options.exclude_patterns)?;
    let mut outcome = WalkOutcome::default();

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let iter = walker
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !should_exclude(entry, root, excludes.as_ref()));

    for entry in iter {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                outcome.warnings.push(WalkWarning {
                    path,
                    message: e.to_string(),
                });
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        match FileInfo::from_entry(&entry, root) {
            Ok(Some(file_info)) => outcome.files.push(file_info),
            Ok(None) => {}
            Err(e) => outcome.warnings.push(WalkWarning {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    Ok(outcome)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, root: &Path, excludes: Option<&GlobSet>) -> bool {
    let Some(globset) = excludes else {
        return false;
    };

    if globset.is_match(entry.file_name()) {
        return true;
    }

    match entry.path().strip_prefix(root) {
        Ok(relative) => globset.is_match(relative),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(outcome: &WalkOutcome) -> Vec<String> {
        let mut names: Vec<String> = outcome
            .files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().replace('\\', "/"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_walk_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let outcome = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(outcome.files.len(), 0);
        assert!(outcome.warnings.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let outcome = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(names(&outcome), ["file1.txt", "subdir/file2.txt"]);
        assert_eq!(outcome.files.iter().map(|f| f.size).sum::<u64>(), 16);

        Ok(())
    }

    #[test]
    fn test_walk_single_file_root() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("only.txt");
        fs::write(&file, b"12345")?;

        let outcome = walk_directory(&file, &WalkOptions::default())?;
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].path, file);
        assert_eq!(outcome.files[0].size, 5);
        Ok(())
    }

    #[test]
    fn test_exclude_patterns() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("node_modules/pkg"))?;
        fs::create_dir_all(temp_dir.path().join("cache"))?;
        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        fs::write(temp_dir.path().join("scratch.tmp"), b"exclude")?;
        fs::write(temp_dir.path().join("node_modules/pkg/index.js"), b"exclude")?;
        fs::write(temp_dir.path().join("cache/blob"), b"exclude")?;

        let options = WalkOptions {
            exclude_patterns: vec!["*.tmp".into(), "node_modules".into(), "cache/*".into()],
            ..WalkOptions::default()
        };
        let outcome = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(names(&outcome), ["file.txt"]);

        Ok(())
    }

    #[test]
    fn test_missing_root_is_a_warning() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let outcome = walk_directory(&temp_dir.path().join("absent"), &WalkOptions::default())?;
        assert!(outcome.files.is_empty());
        assert_eq!(outcome.warnings.len(), 1);
        Ok(())
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        assert!(build_globset(&["a[".to_string()]).is_err());
    }
}

//! File metadata captured at backup time and re-applied on restore.

use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::path::Path;
use std::time::SystemTime;

/// Metadata preserved per captured file
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: DateTime<Utc>,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path (following symlinks)
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified: system_time_to_utc(metadata.modified()?),
            permissions,
        })
    }

    /// Apply modification time and permissions to an already-written file
    pub fn apply_to_path(path: &Path, modified: DateTime<Utc>, permissions: Option<u32>) -> std::io::Result<()> {
        let file = File::options().write(true).open(path)?;
        file.set_modified(SystemTime::from(modified))?;
        drop(file);

        #[cfg(unix)]
        if let Some(mode) = permissions {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }

        #[cfg(not(unix))]
        let _ = permissions;

        Ok(())
    }
}

pub fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Whether two modification times are equal at millisecond precision.
///
/// Filesystems differ in timestamp granularity, so sub-millisecond noise is ignored.
pub fn same_mtime(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp_millis() == b.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_extract_metadata() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let metadata = FileMetadata::from_path(temp_file.path())?;

        assert_eq!(metadata.size, 12);
        assert!(metadata.modified.timestamp() > 0);

        Ok(())
    }

    #[test]
    fn test_apply_modified_time() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let wanted = Utc::now() - Duration::days(3);

        FileMetadata::apply_to_path(temp_file.path(), wanted, None)?;

        let metadata = FileMetadata::from_path(temp_file.path())?;
        assert!(same_mtime(metadata.modified, wanted));
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_permissions_preservation() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;

        FileMetadata::apply_to_path(temp_file.path(), Utc::now(), Some(0o640))?;

        let metadata = FileMetadata::from_path(temp_file.path())?;
        assert_eq!(metadata.permissions.map(|m| m & 0o777), Some(0o640));
        Ok(())
    }
}

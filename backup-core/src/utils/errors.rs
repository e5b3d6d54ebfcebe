//! Error types for the backup core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DrError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already running: {0}")]
    Busy(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Invalid exclude pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl DrError {
    /// Stable machine-readable category, reported across the operation boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            DrError::InvalidArguments(_) | DrError::Pattern(_) | DrError::Schedule(_) => {
                "invalid_arguments"
            }
            DrError::NotFound(_) => "not_found",
            DrError::Busy(_) => "busy",
            DrError::Integrity(_) => "integrity",
            DrError::Io(_) | DrError::Walk(_) => "io",
            DrError::Serialization(_) => "serialization",
            DrError::Compression(_) => "compression",
            DrError::Config(_) => "config",
            DrError::Task(_) => "internal",
        }
    }

    /// True when the error comes from input validation and nothing was touched.
    pub fn is_validation(&self) -> bool {
        self.kind() == "invalid_arguments"
    }
}

pub type Result<T> = std::result::Result<T, DrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(DrError::InvalidArguments("x".into()).kind(), "invalid_arguments");
        assert_eq!(DrError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(DrError::Schedule("bad cron".into()).kind(), "invalid_arguments");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(DrError::from(io).kind(), "io");
        assert!(DrError::InvalidArguments("x".into()).is_validation());
        assert!(!DrError::Busy("x".into()).is_validation());
    }
}

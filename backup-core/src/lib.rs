//! Backup and disaster-recovery core.
//!
//! Creates checksummed, optionally zstd-compressed backups of file trees,
//! keeps a durable catalog of them, prunes them with a tiered retention
//! policy, restores them without silent data loss and runs them on
//! recurring schedules. [`api::DrService`] is the entry point.

pub mod api;
pub mod catalog;
pub mod config;
pub mod executor;
pub mod fs;
pub mod integrity;
pub mod models;
pub mod restore;
pub mod retention;
pub mod schedule;
pub mod status;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use api::{DrService, Response};
pub use config::Config;
pub use utils::errors::{DrError, Result};

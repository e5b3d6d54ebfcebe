//! Durable record types shared by the catalog, pipeline and schedule registry.

pub mod backup;
pub mod schedule;

pub use backup::{
    compression_ratio, BackupKind, BackupRecord, BackupStatus, FileError, RecordUpdate, Severity,
};
pub use schedule::{
    CreateScheduleRequest, ScheduleDefinition, ScheduleFilter, UpdateScheduleRequest,
};

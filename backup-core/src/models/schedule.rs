use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backup::{BackupKind, BackupStatus};

// ── ScheduleDefinition ──

/// A named recurring backup, persisted in `schedules.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: String,
    pub cron: String,
    pub sources: Vec<String>,
    #[serde(default)]
    pub kind: BackupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_status: Option<BackupStatus>,
    #[serde(default)]
    pub last_backup_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub run_count: u64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateScheduleRequest {
    pub id: String,
    pub cron: String,
    pub sources: Vec<String>,
    #[serde(default)]
    pub kind: BackupKind,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default)]
    pub verify: bool,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateScheduleRequest {
    pub cron: Option<String>,
    pub sources: Option<Vec<String>>,
    pub kind: Option<BackupKind>,
    pub label: Option<Option<String>>,
    pub compression: Option<bool>,
    pub verify: Option<bool>,
    pub exclude_patterns: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleFilter {
    pub enabled: Option<bool>,
    /// Only schedules covering this source root
    pub source: Option<String>,
}

impl ScheduleFilter {
    pub fn matches(&self, schedule: &ScheduleDefinition) -> bool {
        if let Some(enabled) = self.enabled {
            if schedule.enabled != enabled {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if !schedule.sources.iter().any(|s| s == source) {
                return false;
            }
        }
        true
    }
}

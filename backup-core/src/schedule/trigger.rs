//! Trigger expressions.
//!
//! The registry never interprets a trigger expression itself; it asks a
//! [`TriggerSource`] whether an expression is valid and when it next fires.

use crate::utils::errors::{DrError, Result};
use chrono::{DateTime, Utc};
use croner::Cron;

pub trait TriggerSource: Send + Sync {
    /// Reject an expression that can never be scheduled.
    fn validate(&self, expression: &str) -> Result<()>;

    /// Next fire time strictly after `after`, if there is one.
    fn next_run(&self, expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;
}

/// Six-field form of a cron expression: five-field input gets a `0` seconds field.
///
/// This is the form handed to the job scheduler, so validation parses it too.
pub fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Standard five-field cron, with an optional leading seconds field.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronTriggerSource;

impl CronTriggerSource {
    fn parse(expression: &str) -> Result<Cron> {
        if expression.trim().is_empty() {
            return Err(DrError::Schedule("trigger expression is empty".into()));
        }
        Cron::new(&normalize_cron(expression))
            .with_seconds_optional()
            .parse()
            .map_err(|e| DrError::Schedule(format!("invalid cron expression '{expression}': {e}")))
    }
}

impl TriggerSource for CronTriggerSource {
    fn validate(&self, expression: &str) -> Result<()> {
        Self::parse(expression).map(|_| ())
    }

    fn next_run(&self, expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let cron = Self::parse(expression)?;
        // A pattern that never matches again (e.g. Feb 30) has no next run
        Ok(cron.find_next_occurrence(&after, false).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_validate() {
        let source = CronTriggerSource;
        assert!(source.validate("0 2 * * *").is_ok());
        assert!(source.validate("*/30 0 2 * * *").is_ok());
        assert!(matches!(source.validate("not a cron"), Err(DrError::Schedule(_))));
        assert!(source.validate("").is_err());
        assert!(source.validate("61 * * * *").is_err());
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("0 3 * * *"), "0 0 3 * * *");
        assert_eq!(normalize_cron(" 15 0 3 * * * "), "15 0 3 * * *");
    }

    #[test]
    fn test_next_run_is_after_reference() -> Result<()> {
        let source = CronTriggerSource;
        let after = Utc.with_ymd_and_hms(2025, 3, 10, 1, 30, 0).unwrap();
        let next = source.next_run("0 2 * * *", after)?.expect("has a next run");
        assert!(next > after);
        assert_eq!(next.hour(), 2);
        assert_eq!(next.minute(), 0);
        Ok(())
    }
}

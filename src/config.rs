//! Task configuration shared by the scheduler and the backup/restore tasks.

use tracing::warn;

use crate::Result;
use crate::cron::CronSchedule;

/// Schedule used when none is configured.
pub const DEFAULT_SCHEDULE: &str = "@daily";
/// Number of artifacts kept in a store by default.
pub const DEFAULT_MAX_BACKUPS: usize = 7;
/// Upper bound of the random delay, in seconds, by default.
pub const DEFAULT_RANDOM_DELAY: u64 = 1;

/// When a task runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Run once, right away, in the caller.
    Immediate,
    /// Run every time the cron schedule fires.
    Cron(CronSchedule),
}

impl Schedule {
    /// Parses a schedule expression. An empty expression or `none` means
    /// [`Schedule::Immediate`].
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() || expr.eq_ignore_ascii_case("none") {
            return Ok(Schedule::Immediate);
        }
        Ok(Schedule::Cron(expr.parse()?))
    }
}

/// Settings for one backup or restore invocation.
///
/// Built once, then shared read-only with the scheduler and the tasks.
#[derive(Debug, Clone)]
pub struct Config {
    schedule: Schedule,
    max_backups: usize,
    restore_file: Option<String>,
    random_delay: u64,
    allow_overlap: bool,
}

impl Config {
    /// Creates a config for `schedule` with default retention and jitter.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schedule`] when the expression cannot be parsed.
    pub fn new(schedule: &str) -> Result<Self> {
        Ok(Self {
            schedule: Schedule::parse(schedule)?,
            ..Self::immediate()
        })
    }

    /// A config that runs its task once, immediately.
    pub fn immediate() -> Self {
        Self {
            schedule: Schedule::Immediate,
            max_backups: DEFAULT_MAX_BACKUPS,
            restore_file: None,
            random_delay: DEFAULT_RANDOM_DELAY,
            allow_overlap: false,
        }
    }

    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = max_backups;
        self
    }

    /// Restores this artifact instead of the latest one.
    pub fn with_restore_file(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.restore_file = if name.is_empty() { None } else { Some(name) };
        self
    }

    /// Sets the random delay bound in seconds. Values below 1 become 1.
    pub fn with_random_delay(mut self, seconds: i64) -> Self {
        self.random_delay = if seconds <= 0 {
            warn!("Schedule random delay was set to {seconds}, using 1 as default");
            1
        } else {
            seconds as u64
        };
        self
    }

    /// Lets a firing start while the previous one is still executing.
    pub fn with_allow_overlap(mut self, allow: bool) -> Self {
        self.allow_overlap = allow;
        self
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    pub fn restore_file(&self) -> Option<&str> {
        self.restore_file.as_deref()
    }

    /// Exclusive upper bound, in seconds, of the jitter before each firing.
    /// Always at least 1.
    pub fn random_delay(&self) -> u64 {
        self.random_delay
    }

    pub fn allow_overlap(&self) -> bool {
        self.allow_overlap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_immediate_sentinels() {
        assert_eq!(Schedule::parse("").unwrap(), Schedule::Immediate);
        assert_eq!(Schedule::parse("none").unwrap(), Schedule::Immediate);
        assert_eq!(Schedule::parse(" None ").unwrap(), Schedule::Immediate);
    }

    #[test]
    fn test_cron_schedule() {
        let config = Config::new("*/5 * * * *").unwrap();
        assert!(matches!(config.schedule(), Schedule::Cron(_)));
        assert_eq!(config.max_backups(), DEFAULT_MAX_BACKUPS);
        assert_eq!(config.random_delay(), DEFAULT_RANDOM_DELAY);
        assert!(!config.allow_overlap());
        assert_eq!(config.restore_file(), None);
    }

    #[test]
    fn test_invalid_schedule_is_config_error() {
        let err = Config::new("every day").unwrap_err();
        assert!(matches!(err, Error::Schedule(_)));
    }

    #[test]
    fn test_random_delay_coerced() {
        assert_eq!(Config::immediate().with_random_delay(0).random_delay(), 1);
        assert_eq!(Config::immediate().with_random_delay(-30).random_delay(), 1);
        assert_eq!(Config::immediate().with_random_delay(90).random_delay(), 90);
    }

    #[test]
    fn test_empty_restore_file_is_none() {
        let config = Config::immediate().with_restore_file("");
        assert_eq!(config.restore_file(), None);
        let config = config.with_restore_file("db-20240101000000.sql");
        assert_eq!(config.restore_file(), Some("db-20240101000000.sql"));
    }
}

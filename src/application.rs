//! Configuration file for the autobackup binary.
//!
//! A single TOML file describes one job: when it runs (`[task]`), what it
//! backs up (`[source]`) and where artifacts go (`[store]`). Backends are
//! picked by the `type` key of their table and validated while the job is
//! assembled, before anything runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::config::{Config, DEFAULT_MAX_BACKUPS, DEFAULT_RANDOM_DELAY, DEFAULT_SCHEDULE};
use crate::error::IoContext;
use crate::sources::{ConsulSource, MysqlSource, PostgresSource, Source, TarballSource};
use crate::stores::{FilesystemStore, S3Store, Store};
use crate::tasks::Scheduler;
use crate::{Error, Result};

/// Package name, also the name of the configuration directory.
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Default configuration file name.
pub const CONFIG_NAME: &str = "config.toml";

/// Contents of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Application {
    #[serde(default)]
    pub task: TaskSettings,
    pub source: SourceSettings,
    pub store: StoreSettings,
}

/// The `[task]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    /// Cron expression, descriptor, or `none` to run once.
    pub schedule: String,
    pub max_backups: usize,
    /// Restore this artifact instead of the latest one.
    pub restore_file: Option<String>,
    pub random_delay: i64,
    pub allow_overlap: bool,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_SCHEDULE.to_string(),
            max_backups: DEFAULT_MAX_BACKUPS,
            restore_file: None,
            random_delay: DEFAULT_RANDOM_DELAY as i64,
            allow_overlap: false,
        }
    }
}

impl TryFrom<&TaskSettings> for Config {
    type Error = Error;

    fn try_from(settings: &TaskSettings) -> Result<Self> {
        let config = Config::new(&settings.schedule)?
            .with_max_backups(settings.max_backups)
            .with_random_delay(settings.random_delay)
            .with_allow_overlap(settings.allow_overlap);
        Ok(match &settings.restore_file {
            Some(name) => config.with_restore_file(name.as_str()),
            None => config,
        })
    }
}

/// The `[source]` table.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSettings {
    Tarball(TarballSource),
    Mysql(MysqlSource),
    Postgres(PostgresSource),
    Consul(ConsulSource),
}

impl SourceSettings {
    pub fn build(self) -> Result<Arc<dyn Source>> {
        Ok(match self {
            SourceSettings::Tarball(source) => {
                source.validate()?;
                Arc::new(source)
            }
            SourceSettings::Mysql(source) => {
                source.validate()?;
                Arc::new(source)
            }
            SourceSettings::Postgres(source) => {
                source.validate()?;
                Arc::new(source)
            }
            SourceSettings::Consul(source) => {
                source.validate()?;
                Arc::new(source)
            }
        })
    }
}

/// The `[store]` table.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreSettings {
    Filesystem(FilesystemStore),
    S3(S3Store),
}

impl StoreSettings {
    pub fn build(self) -> Result<Arc<dyn Store>> {
        Ok(match self {
            StoreSettings::Filesystem(store) => {
                store.validate()?;
                Arc::new(store)
            }
            StoreSettings::S3(store) => {
                store.validate()?;
                Arc::new(store)
            }
        })
    }
}

/// A validated job, ready to be scheduled.
pub struct Job {
    pub config: Config,
    pub source: Arc<dyn Source>,
    pub store: Arc<dyn Store>,
}

impl Job {
    pub fn backup(self) -> Scheduler {
        Scheduler::backup(self.config, self.source, self.store)
    }

    pub fn restore(self) -> Scheduler {
        Scheduler::restore(self.config, self.source, self.store)
    }
}

impl Application {
    /// Reads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .io_context(|| format!("error reading config file {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("error parsing config file: {e}")))
    }

    /// Validates every section and assembles the job.
    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            config: Config::try_from(&self.task)?,
            source: self.source.build()?,
            store: self.store.build()?,
        })
    }
}

/// Returns the absolute path to the default configuration file.
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_NAME))
}

/// Returns the configuration directory for the application, platform-specific.
#[cfg(not(target_os = "macos"))]
fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("couldn't get the config directory".to_string()))?;
    Ok(config_dir.join(PKG_NAME))
}

/// Returns the configuration directory for the application, platform-specific.
#[cfg(target_os = "macos")]
fn config_dir() -> Result<PathBuf> {
    let home_dir = dirs::home_dir()
        .ok_or_else(|| Error::Config("couldn't get the home directory".to_string()))?;
    Ok(home_dir.join(".config").join(PKG_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Schedule;

    const FULL: &str = r#"
[task]
schedule = "0 30 2 * * *"
max_backups = 3
random_delay = 120
allow_overlap = true

[source]
type = "mysql"
host = "db.internal"
user = "backup"
password = "s3cret"
database = "shop"
compress = true
ignore_exit_code = true
run_as = { uid = 999, gid = 999 }

[store]
type = "s3"
bucket = "backups"
prefix = "nightly/shop"
region = "eu-west-1"
endpoint = "http://minio:9000"
force_path_style = true
"#;

    #[test]
    fn test_config_file() {
        let file = config_dir().unwrap().join("config.toml");
        assert_eq!(config_file().unwrap(), file);
        assert!(file.parent().unwrap().ends_with(PKG_NAME));
    }

    #[test]
    fn test_parse_full_file() {
        let app = Application::parse(FULL).unwrap();
        assert!(matches!(app.source, SourceSettings::Mysql(_)));
        assert!(matches!(app.store, StoreSettings::S3(_)));

        let job = app.into_job().unwrap();
        assert!(matches!(job.config.schedule(), Schedule::Cron(_)));
        assert_eq!(job.config.max_backups(), 3);
        assert_eq!(job.config.random_delay(), 120);
        assert!(job.config.allow_overlap());
    }

    #[test]
    fn test_task_defaults() {
        let app = Application::parse(
            r#"
[source]
type = "tarball"
path = "/srv/www"

[store]
type = "filesystem"
save_dir = "/var/backups"
"#,
        )
        .unwrap();
        assert_eq!(app.task.schedule, DEFAULT_SCHEDULE);

        let job = app.into_job().unwrap();
        assert_eq!(job.config.max_backups(), DEFAULT_MAX_BACKUPS);
        assert_eq!(job.config.random_delay(), DEFAULT_RANDOM_DELAY);
        assert_eq!(job.config.restore_file(), None);
    }

    #[test]
    fn test_unknown_source_type() {
        let err = Application::parse(
            r#"
[source]
type = "mongodb"

[store]
type = "filesystem"
save_dir = "/var/backups"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_schedule_fails_assembly() {
        let app = Application::parse(
            r#"
[task]
schedule = "61 * * * *"

[source]
type = "consul"

[store]
type = "filesystem"
save_dir = "/var/backups"
"#,
        )
        .unwrap();
        assert!(matches!(app.into_job(), Err(Error::Schedule(_))));
    }

    #[test]
    fn test_backend_validation_runs_on_build() {
        let app = Application::parse(
            r#"
[task]
schedule = "none"
restore_file = "postgres-backup-20240101000000.sql"

[source]
type = "postgres"
user = "admin"
drop = true

[store]
type = "filesystem"
save_dir = "/var/backups"
"#,
        )
        .unwrap();
        let err = app.into_job().err().unwrap();
        assert!(err.to_string().contains("requires a database name"));
    }

    #[test]
    fn test_negative_delay_is_coerced() {
        let settings = TaskSettings {
            schedule: "none".to_string(),
            random_delay: -5,
            restore_file: Some(String::new()),
            ..TaskSettings::default()
        };
        let config = Config::try_from(&settings).unwrap();
        assert_eq!(config.random_delay(), 1);
        assert_eq!(config.restore_file(), None);
        assert_eq!(config.schedule(), &Schedule::Immediate);
    }
}

//! PostgreSQL source backed by `pg_dump`, `pg_dumpall`, `pg_restore` and `psql`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{
    Source, check_restore, default_host, default_save_dir, discard_on_error, open_artifact,
    write_gzip,
};
use crate::artifact;
use crate::command::{CommandRunner, Credential};
use crate::error::RecreateStep;
use crate::{Error, Result};

/// Database psql connects to while the target database is dropped.
const MAINTENANCE_DATABASE: &str = "postgres";

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresSource {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    user: String,
    #[serde(default)]
    password: Option<String>,
    /// Single database to dump; the whole cluster through `pg_dumpall` when unset.
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    options: String,
    #[serde(default)]
    compress: bool,
    /// Use the custom archive format. Only honoured with a single database.
    #[serde(default)]
    custom: bool,
    #[serde(default = "default_save_dir")]
    save_dir: PathBuf,
    #[serde(default)]
    ignore_exit_code: bool,
    /// Drop and recreate the database before restoring into it.
    #[serde(default)]
    drop: bool,
    /// Owner of the recreated database; the connecting user when unset.
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    run_as: Option<Credential>,
    #[serde(default)]
    programs: Programs,
}

/// Locations of the PostgreSQL client binaries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Programs {
    pub pg_dump: PathBuf,
    pub pg_dumpall: PathBuf,
    pub pg_restore: PathBuf,
    pub psql: PathBuf,
}

impl Default for Programs {
    fn default() -> Self {
        Self {
            pg_dump: PathBuf::from("/usr/bin/pg_dump"),
            pg_dumpall: PathBuf::from("/usr/bin/pg_dumpall"),
            pg_restore: PathBuf::from("/usr/bin/pg_restore"),
            psql: PathBuf::from("/usr/bin/psql"),
        }
    }
}

fn default_port() -> u16 {
    5432
}

impl PostgresSource {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: None,
            database: None,
            options: String::new(),
            compress: false,
            custom: false,
            save_dir: default_save_dir(),
            ignore_exit_code: false,
            drop: false,
            owner: None,
            run_as: None,
            programs: Programs::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_custom_format(mut self, custom: bool) -> Self {
        self.custom = custom;
        self
    }

    pub fn with_save_dir(mut self, save_dir: impl Into<PathBuf>) -> Self {
        self.save_dir = save_dir.into();
        self
    }

    pub fn with_ignore_exit_code(mut self, ignore: bool) -> Self {
        self.ignore_exit_code = ignore;
        self
    }

    /// Drops and recreates the database, owned by `owner`, before restoring.
    pub fn with_drop(mut self, drop: bool, owner: Option<String>) -> Self {
        self.drop = drop;
        self.owner = owner;
        self
    }

    pub fn with_run_as(mut self, credential: Credential) -> Self {
        self.run_as = Some(credential);
        self
    }

    pub fn with_programs(mut self, programs: Programs) -> Self {
        self.programs = programs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        super::require_non_empty(&self.host, "postgres host")?;
        super::require_non_empty(&self.user, "postgres user")?;
        if self.drop && self.database.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Config(
                "postgres drop requires a database name".to_string(),
            ));
        }
        for program in [
            &self.programs.pg_dump,
            &self.programs.pg_dumpall,
            &self.programs.pg_restore,
            &self.programs.psql,
        ] {
            super::require_absolute(program)?;
        }
        Ok(())
    }

    /// Custom format needs a single database to dump.
    fn custom_format(&self) -> bool {
        self.custom && self.database.is_some()
    }

    fn connection_args(&self) -> Vec<String> {
        vec![
            "-h".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-U".to_string(),
            self.user.clone(),
        ]
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = self.connection_args();
        if let Some(database) = &self.database {
            args.extend(["-d".to_string(), database.clone()]);
        }
        args.extend(super::split_options(&self.options));
        args
    }

    fn command<'a>(&self) -> CommandRunner<'a> {
        let runner = CommandRunner::new().credential(self.run_as);
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => runner.env("PGPASSWORD", password),
            None => runner,
        }
    }

    fn backup_blocking(&self) -> Result<PathBuf> {
        let mut args = self.base_args();
        let program = if self.database.is_some() {
            &self.programs.pg_dump
        } else {
            &self.programs.pg_dumpall
        };

        let extension = if self.custom_format() {
            ".dump"
        } else if self.compress {
            ".sql.gz"
        } else {
            ".sql"
        };
        let path = artifact::generate_path(&self.save_dir, "postgres-backup", extension);

        if self.custom_format() {
            args.extend([
                "-f".to_string(),
                path.to_string_lossy().into_owned(),
                "-Fc".to_string(),
            ]);
            let dumped = self.command().run(program, &args);
            discard_on_error(&path, dumped.map_err(Error::from))?;
        } else if self.compress {
            write_gzip(&path, |out| {
                Ok(self.command().output(out).run(program, &args)?)
            })?;
        } else {
            args.extend(["-f".to_string(), path.to_string_lossy().into_owned()]);
            let dumped = self.command().run(program, &args);
            discard_on_error(&path, dumped.map_err(Error::from))?;
        }

        info!("PostgreSQL dump written to {}", path.display());
        Ok(path)
    }

    fn restore_blocking(&self, path: &Path) -> Result<()> {
        let mut args = self.base_args();

        // open the artifact before anything destructive happens
        let input = if self.custom_format() {
            args.push(path.to_string_lossy().into_owned());
            None
        } else {
            Some(open_artifact(path)?)
        };

        if self.drop {
            self.recreate()?;
        }

        let result = match input {
            None => self.command().run(&self.programs.pg_restore, &args),
            Some(input) => self.command().input(input).run(&self.programs.psql, &args),
        };
        check_restore(result, self.ignore_exit_code)
    }

    /// Terminates other sessions, then drops and creates the database again.
    fn recreate(&self) -> Result<()> {
        let database = self
            .database
            .as_deref()
            .ok_or_else(|| Error::Config("postgres drop requires a database name".to_string()))?;
        let owner = self.owner.as_deref().unwrap_or(&self.user);
        info!("Recreating database {database}");

        let steps = [
            (
                RecreateStep::Terminate,
                format!(
                    "SELECT pg_terminate_backend(pg_stat_activity.pid) FROM pg_stat_activity \
                     WHERE pg_stat_activity.datname = {} AND pid <> pg_backend_pid();",
                    quote_literal(database)
                ),
            ),
            (
                RecreateStep::Drop,
                format!("DROP DATABASE {};", quote_identifier(database)),
            ),
            (
                RecreateStep::Create,
                format!(
                    "CREATE DATABASE {} OWNER {};",
                    quote_identifier(database),
                    quote_identifier(owner)
                ),
            ),
        ];

        for (step, query) in steps {
            let mut args = self.connection_args();
            args.extend([
                MAINTENANCE_DATABASE.to_string(),
                "-c".to_string(),
                query,
            ]);
            self.command()
                .run(&self.programs.psql, &args)
                .map_err(|source| Error::Recreate { step, source })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Source for PostgresSource {
    async fn backup(&self) -> Result<PathBuf> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.backup_blocking()).await?
    }

    async fn restore(&self, path: &Path) -> Result<()> {
        let source = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || source.restore_blocking(&path)).await?
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_base_args() {
        let source = PostgresSource::new("pg", "admin")
            .with_database("shop")
            .with_options("--no-owner");
        assert_eq!(
            source.base_args(),
            vec!["-h", "pg", "-p", "5432", "-U", "admin", "-d", "shop", "--no-owner"]
        );
    }

    #[test]
    fn test_custom_format_needs_database() {
        let source = PostgresSource::new("pg", "admin").with_custom_format(true);
        assert!(!source.custom_format());
        assert!(source.with_database("shop").custom_format());
    }

    #[test]
    fn test_drop_requires_database() {
        let source = PostgresSource::new("pg", "admin").with_drop(true, None);
        assert!(matches!(source.validate(), Err(Error::Config(_))));
        assert!(source.with_database("shop").validate().is_ok());
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_identifier("my\"db"), "\"my\"\"db\"");
        assert_eq!(quote_literal("o'neil"), "'o''neil'");
    }

    #[cfg(unix)]
    fn fake_psql(dir: &Path, fail_on: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("psql.log");
        let script = dir.join("psql");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\nfor last; do :; done\necho \"$last\" >> {}\ncase \"$last\" in *{fail_on}*) exit 1;; esac\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[test]
    fn test_recreate_runs_steps_in_order() {
        let dir = tempdir().unwrap();
        let psql = fake_psql(dir.path(), "NEVER");
        let source = PostgresSource::new("pg", "admin")
            .with_database("shop")
            .with_drop(true, Some("owner".to_string()))
            .with_programs(Programs {
                psql,
                ..Programs::default()
            });

        source.recreate().unwrap();

        let log = fs::read_to_string(dir.path().join("psql.log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("pg_terminate_backend") && lines[0].contains("'shop'"));
        assert_eq!(lines[1], "DROP DATABASE \"shop\";");
        assert_eq!(lines[2], "CREATE DATABASE \"shop\" OWNER \"owner\";");
    }

    #[cfg(unix)]
    #[test]
    fn test_recreate_stops_at_failing_step() {
        let dir = tempdir().unwrap();
        let psql = fake_psql(dir.path(), "DROP");
        let source = PostgresSource::new("pg", "admin")
            .with_database("shop")
            .with_drop(true, None)
            .with_programs(Programs {
                psql,
                ..Programs::default()
            });

        let err = source.recreate().unwrap_err();
        assert!(matches!(
            err,
            Error::Recreate {
                step: RecreateStep::Drop,
                ..
            }
        ));
        let log = fs::read_to_string(dir.path().join("psql.log")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }
}

//! MySQL source backed by `mysqldump` and `mysql`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{
    Source, check_restore, default_host, default_save_dir, discard_on_error, open_artifact,
    write_gzip,
};
use crate::{Error, Result};
use crate::artifact;
use crate::command::{CommandRunner, Credential};

/// Flag whose attached value is hidden in logged command lines.
const PASSWORD_FLAG: &str = "-p";

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlSource {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    user: String,
    #[serde(default)]
    password: Option<String>,
    /// Dump a single database; all databases when unset.
    #[serde(default)]
    database: Option<String>,
    /// Extra options appended to every invocation, split on whitespace.
    #[serde(default)]
    options: String,
    #[serde(default)]
    compress: bool,
    #[serde(default = "default_save_dir")]
    save_dir: PathBuf,
    #[serde(default)]
    ignore_exit_code: bool,
    #[serde(default)]
    run_as: Option<Credential>,
    #[serde(default = "default_dump_cmd")]
    dump_cmd: PathBuf,
    #[serde(default = "default_restore_cmd")]
    restore_cmd: PathBuf,
}

fn default_port() -> u16 {
    3306
}

fn default_dump_cmd() -> PathBuf {
    PathBuf::from("/usr/bin/mysqldump")
}

fn default_restore_cmd() -> PathBuf {
    PathBuf::from("/usr/bin/mysql")
}

impl MysqlSource {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: None,
            database: None,
            options: String::new(),
            compress: false,
            save_dir: default_save_dir(),
            ignore_exit_code: false,
            run_as: None,
            dump_cmd: default_dump_cmd(),
            restore_cmd: default_restore_cmd(),
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

    pub fn with_save_dir(mut self, save_dir: impl Into<PathBuf>) -> Self {
        self.save_dir = save_dir.into();
        self
    }

    pub fn with_ignore_exit_code(mut self, ignore: bool) -> Self {
        self.ignore_exit_code = ignore;
        self
    }

    pub fn with_run_as(mut self, credential: Credential) -> Self {
        self.run_as = Some(credential);
        self
    }

    /// Overrides the `mysqldump` and `mysql` binaries.
    pub fn with_programs(mut self, dump: impl Into<PathBuf>, restore: impl Into<PathBuf>) -> Self {
        self.dump_cmd = dump.into();
        self.restore_cmd = restore.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        super::require_non_empty(&self.host, "mysql host")?;
        super::require_non_empty(&self.user, "mysql user")?;
        super::require_absolute(&self.dump_cmd)?;
        super::require_absolute(&self.restore_cmd)
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-h".to_string(),
            self.host.clone(),
            "-P".to_string(),
            self.port.to_string(),
            "-u".to_string(),
            self.user.clone(),
        ];
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            args.push(format!("{PASSWORD_FLAG}{password}"));
        }
        args.extend(super::split_options(&self.options));
        args
    }

    fn command<'a>(&self) -> CommandRunner<'a> {
        CommandRunner::new()
            .redact(PASSWORD_FLAG)
            .credential(self.run_as)
    }

    fn backup_blocking(&self) -> Result<PathBuf> {
        let mut args = self.base_args();
        match &self.database {
            Some(database) => args.extend(["-B".to_string(), database.clone()]),
            None => args.push("--all-databases".to_string()),
        }

        let extension = if self.compress { ".sql.gz" } else { ".sql" };
        let path = artifact::generate_path(&self.save_dir, "mysql-backup", extension);

        if self.compress {
            write_gzip(&path, |out| {
                Ok(self.command().output(out).run(&self.dump_cmd, &args)?)
            })?;
        } else {
            args.extend(["-r".to_string(), path.to_string_lossy().into_owned()]);
            let dumped = self.command().run(&self.dump_cmd, &args);
            discard_on_error(&path, dumped.map_err(Error::from))?;
        }

        info!("MySQL dump written to {}", path.display());
        Ok(path)
    }

    fn restore_blocking(&self, path: &Path) -> Result<()> {
        let mut args = self.base_args();
        if let Some(database) = &self.database {
            args.extend(["-D".to_string(), database.clone()]);
        }

        let input = open_artifact(path)?;
        let result = self.command().input(input).run(&self.restore_cmd, &args);
        check_restore(result, self.ignore_exit_code)
    }
}

#[async_trait]
impl Source for MysqlSource {
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

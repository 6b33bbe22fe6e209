//! Command-line interface definition for autobackup.

use std::path::{Path, PathBuf};
use std::process;

use autobackup::application::{self, Application, Job};
use autobackup::{Result, sysexits};
use clap::{Args, Parser, Subcommand};

/// Command-line interface definition for autobackup.
#[derive(Parser)]
#[command(version, about, long_about = None)]
pub(crate) struct Cli {
    /// Configuration file. Defaults to `<config dir>/autobackup/config.toml`.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `info,autobackup=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    /// Subcommand to execute.
    #[command(subcommand)]
    pub commands: Option<Commands>,
}

/// Supported autobackup commands.
#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Back up the configured source into the configured store.
    Backup(RunArgs),
    /// Restore the configured source from the configured store.
    Restore {
        #[command(flatten)]
        run: RunArgs,
        /// Artifact to restore instead of the latest one.
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Print the path of the default configuration file.
    Config,
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Run once right away, ignoring the configured schedule.
    #[arg(long)]
    pub once: bool,
}

/// Prints the default configuration file location.
pub(crate) fn config() {
    match application::config_file() {
        Ok(path) => println!("{}", path.display()),
        Err(e) => fail(e.to_string(), sysexits::EX_CONFIG),
    }
}

/// Reads the configuration file and assembles the job, exiting on failure.
pub(crate) fn load(path: Option<PathBuf>, once: bool, restore_file: Option<String>) -> Job {
    let path = path.unwrap_or_else(|| {
        application::config_file().unwrap_or_else(|e| fail(e.to_string(), sysexits::EX_CONFIG))
    });
    let mut app = read(&path);

    if once {
        app.task.schedule = "none".to_string();
    }
    if restore_file.is_some() {
        app.task.restore_file = restore_file;
    }

    app.into_job()
        .unwrap_or_else(|e| fail(e.to_string(), sysexits::exit_code(&e)))
}

fn read(path: &Path) -> Application {
    if !path.exists() {
        fail(
            format!("Config file {} does not exist", path.display()),
            sysexits::EX_NOINPUT,
        );
    }
    Application::load(path).unwrap_or_else(|e| fail(e.to_string(), sysexits::exit_code(&e)))
}

/// Runs the backup job until it completes or, when scheduled, until shutdown.
pub(crate) async fn backup(job: Job) -> Result<()> {
    job.backup().run_until_shutdown().await
}

/// Runs the restore job until it completes or, when scheduled, until shutdown.
pub(crate) async fn restore(job: Job) -> Result<()> {
    job.restore().run_until_shutdown().await
}

fn fail(message: String, code: i32) -> ! {
    eprintln!("{message}");
    process::exit(code);
}

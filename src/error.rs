//! Error types shared by every stage of a backup or restore.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::command::CommandError;
use crate::cron::CronError;

/// Unified result type for all fallible operations in autobackup.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed settings, reported before any task runs.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid schedule: {0}")]
    Schedule(#[from] CronError),
    /// An external program failed to start, exited unsuccessfully or broke a stream.
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    /// Listing or transfer failure against a remote store.
    #[error("{context}: {message}")]
    Remote { context: String, message: String },
    #[error("cannot find a recent backup on {0}")]
    NotFound(String),
    #[error("unsupported file extension: {0}")]
    UnsupportedFormat(String),
    #[error("couldn't recreate database, psql error on {step}: {source}")]
    Recreate {
        step: RecreateStep,
        #[source]
        source: CommandError,
    },
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps the error with the task stage it happened in.
    pub fn stage(self, stage: Stage) -> Self {
        Error::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Returns true when the innermost error is a missing backup.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Stage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Steps of a task pipeline, used to say where a task failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Backup,
    Upload,
    Prune,
    FindLatest,
    Retrieve(String),
    Restore,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Backup => f.write_str("source backup failed"),
            Stage::Upload => f.write_str("couldn't upload file to store"),
            Stage::Prune => f.write_str("couldn't remove old backups from store"),
            Stage::FindLatest => f.write_str("cannot find the latest backup"),
            Stage::Retrieve(name) => write!(f, "cannot download file {name}"),
            Stage::Restore => f.write_str("source restore failed"),
        }
    }
}

/// Steps of a destructive database restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateStep {
    Terminate,
    Drop,
    Create,
}

impl fmt::Display for RecreateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecreateStep::Terminate => f.write_str("terminate"),
            RecreateStep::Drop => f.write_str("drop"),
            RecreateStep::Create => f.write_str("create"),
        }
    }
}

/// Attaches a human readable context to I/O failures.
pub(crate) trait IoContext<T> {
    fn io_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| Error::Io {
            context: context(),
            source,
        })
    }
}

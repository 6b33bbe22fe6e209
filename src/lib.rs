//! autobackup: scheduled backups and restores of databases and directories.
//!
//! A [`sources::Source`] produces a timestamped artifact, a [`stores::Store`]
//! keeps it and prunes old ones, and a [`tasks::Scheduler`] runs the pipeline
//! once or on a cron schedule.

pub mod application;
pub mod artifact;
pub mod command;
pub mod config;
pub mod cron;
pub mod error;
pub mod logging;
pub mod sources;
pub mod stores;
pub mod sysexits;
pub mod tasks;

pub use config::{Config, Schedule};
pub use error::{Error, Result};
pub use tasks::{Scheduler, backup_task, restore_task};

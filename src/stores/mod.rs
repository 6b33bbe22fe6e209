//! Stores: destinations that keep artifacts and hand them back for restores.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::Result;

mod filesystem;
mod s3;

pub use filesystem::FilesystemStore;
pub use s3::S3Store;

#[async_trait]
pub trait Store: Send + Sync {
    /// Persists the local artifact at `path` under `name`.
    async fn store(&self, path: &Path, name: &str) -> Result<()>;

    /// Makes the artifact `name` available locally and returns its path.
    async fn retrieve(&self, name: &str) -> Result<PathBuf>;

    /// Deletes the oldest artifacts so that at most `keep` remain.
    async fn remove_older_backups(&self, keep: usize) -> Result<()>;

    /// Name of the most recent artifact, as accepted by [`Store::retrieve`].
    async fn find_latest_backup(&self) -> Result<String>;

    /// Releases whatever [`Store::retrieve`] left behind. Safe to call twice.
    async fn close(&self);
}

/// Sorts `names` and returns the ones to delete to keep only `keep`.
pub(crate) fn expired(mut names: Vec<String>, keep: usize) -> Vec<String> {
    names.sort();
    let count = names.len().saturating_sub(keep);
    names.truncate(count);
    names
}

/// The most recent artifact name, if any.
pub(crate) fn latest(names: Vec<String>) -> Option<String> {
    names.into_iter().max()
}

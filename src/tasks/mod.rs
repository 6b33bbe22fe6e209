//! Backup and restore pipelines, and the scheduler that triggers them.

use tracing::info;

use crate::config::Config;
use crate::error::Stage;
use crate::sources::Source;
use crate::stores::Store;
use crate::{Error, Result};

pub mod scheduler;

pub use scheduler::Scheduler;

/// Dumps `source`, hands the artifact to `store`, then prunes the store.
///
/// Stops at the first failing stage. A failed prune after a successful
/// upload is still reported as a failure; nothing is rolled back.
pub async fn backup_task(config: &Config, source: &dyn Source, store: &dyn Store) -> Result<()> {
    let path = source.backup().await.map_err(|e| e.stage(Stage::Backup))?;
    info!("Backup saved to {}", path.display());

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::Config(format!("artifact {} has no file name", path.display()))
                .stage(Stage::Backup)
        })?;

    store
        .store(&path, &name)
        .await
        .map_err(|e| e.stage(Stage::Upload))?;

    store
        .remove_older_backups(config.max_backups())
        .await
        .map_err(|e| e.stage(Stage::Prune))
}

/// Restores the configured artifact, or the latest one, into `source`.
///
/// Once retrieved, the store is closed whatever the restore outcome.
pub async fn restore_task(config: &Config, source: &dyn Source, store: &dyn Store) -> Result<()> {
    let name = match config.restore_file() {
        Some(name) => name.to_string(),
        None => store
            .find_latest_backup()
            .await
            .map_err(|e| e.stage(Stage::FindLatest))?,
    };

    let path = store
        .retrieve(&name)
        .await
        .map_err(|e| e.stage(Stage::Retrieve(name.clone())))?;

    info!("Restoring {}", path.display());
    let restored = source.restore(&path).await;
    store.close().await;

    restored.map_err(|e| e.stage(Stage::Restore))
}

//! Filesystem store keeping artifacts in a local directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};

use super::{Store, expired, latest};
use crate::error::IoContext;
use crate::{Error, Result};

/// Keeps artifacts as plain files in a local directory.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemStore {
    save_dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn validate(&self) -> Result<()> {
        if self.save_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "filesystem store needs a save_dir".to_string(),
            ));
        }
        Ok(())
    }

    /// Names of the regular files in the save directory.
    async fn list(&self) -> Result<Vec<String>> {
        let context = || {
            format!(
                "cannot list contents of directory {}",
                self.save_dir.display()
            )
        };
        let mut entries = fs::read_dir(&self.save_dir).await.io_context(context)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.io_context(context)? {
            if entry.file_type().await.io_context(context)?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}

/// Copies `src` to `dest`, syncs it, then deletes `src`.
async fn copy_then_remove(src: &Path, dest: &Path) -> Result<()> {
    fs::copy(src, dest).await.io_context(|| {
        format!(
            "error while copying {} to {}",
            src.display(),
            dest.display()
        )
    })?;
    fs::File::open(dest)
        .await
        .io_context(|| format!("cannot open destination file {}", dest.display()))?
        .sync_all()
        .await
        .io_context(|| format!("cannot flush file contents of {}", dest.display()))?;

    if let Err(err) = fs::remove_file(src).await {
        warn!("Cannot remove source file {}: {err}", src.display());
    }
    Ok(())
}

#[async_trait]
impl Store for FilesystemStore {
    async fn store(&self, path: &Path, name: &str) -> Result<()> {
        fs::create_dir_all(&self.save_dir)
            .await
            .io_context(|| format!("cannot create directory {}", self.save_dir.display()))?;
        let dest = self.save_dir.join(name);

        let same = match (fs::canonicalize(path).await, fs::canonicalize(&dest).await) {
            (Ok(src), Ok(dest)) => src == dest,
            _ => false,
        };
        if same {
            info!("Using the same path as source and destination, do nothing");
            return Ok(());
        }

        match fs::rename(path, &dest).await {
            Ok(()) => {}
            Err(err) => {
                info!(
                    "Cannot rename {} to {} ({err}), trying to copy instead",
                    path.display(),
                    dest.display()
                );
                copy_then_remove(path, &dest).await?;
            }
        }

        info!("Stored {}", dest.display());
        Ok(())
    }

    async fn retrieve(&self, name: &str) -> Result<PathBuf> {
        Ok(self.save_dir.join(name))
    }

    async fn remove_older_backups(&self, keep: usize) -> Result<()> {
        let doomed = expired(self.list().await?, keep);
        if doomed.is_empty() {
            return Ok(());
        }

        let mut deleted = 0;
        for name in &doomed {
            let path = self.save_dir.join(name);
            match fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!("Failed to remove file {}: {err}", path.display()),
            }
        }
        info!("Deleted {deleted} objects from {}", self.save_dir.display());
        Ok(())
    }

    async fn find_latest_backup(&self) -> Result<String> {
        latest(self.list().await?)
            .ok_or_else(|| Error::NotFound(self.save_dir.display().to_string()))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_store_moves_artifact() {
        let work = tempdir().unwrap();
        let saves = tempdir().unwrap();
        let artifact = work.path().join("site-backup-20240101000000.tar");
        stdfs::write(&artifact, "payload").unwrap();

        let store = FilesystemStore::new(saves.path().join("nested"));
        store
            .store(&artifact, "site-backup-20240101000000.tar")
            .await
            .unwrap();

        assert!(!artifact.exists());
        let stored = saves.path().join("nested/site-backup-20240101000000.tar");
        assert_eq!(stdfs::read_to_string(stored).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_store_same_path_is_noop() {
        let saves = tempdir().unwrap();
        let artifact = saves.path().join("a-20240101000000.tar");
        stdfs::write(&artifact, "payload").unwrap();

        let store = FilesystemStore::new(saves.path());
        store.store(&artifact, "a-20240101000000.tar").await.unwrap();

        assert_eq!(stdfs::read_to_string(&artifact).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_copy_then_remove() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.tar");
        let dest = dir.path().join("dest.tar");
        stdfs::write(&src, "payload").unwrap();

        copy_then_remove(&src, &dest).await.unwrap();

        assert!(!src.exists());
        assert_eq!(stdfs::read_to_string(&dest).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_copy_failure_keeps_source() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.tar");
        stdfs::write(&src, "payload").unwrap();

        let dest = dir.path().join("missing/dest.tar");
        assert!(copy_then_remove(&src, &dest).await.is_err());
        assert!(src.exists());
    }

    #[tokio::test]
    async fn test_list_skips_directories() {
        let saves = tempdir().unwrap();
        stdfs::create_dir(saves.path().join("zzz-dir")).unwrap();
        stdfs::write(saves.path().join("a-20240101000000.tar"), "").unwrap();

        let store = FilesystemStore::new(saves.path());
        assert_eq!(
            store.find_latest_backup().await.unwrap(),
            "a-20240101000000.tar"
        );
    }

    #[tokio::test]
    async fn test_find_latest_on_empty_dir() {
        let saves = tempdir().unwrap();
        let store = FilesystemStore::new(saves.path());
        let err = store.find_latest_backup().await.unwrap_err();
        assert!(err.is_not_found());
    }
}

//! Tarball source: archives a file or directory, restores it in place.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;
use tracing::info;

use super::{Source, default_save_dir, remove_directory_contents};
use crate::artifact;
use crate::error::IoContext;
use crate::{Error, Result};

/// Archive formats recognised on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Tar,
    TarGz,
}

impl ArchiveFormat {
    fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TarballSource {
    /// Artifact prefix; defaults to the target's base name.
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_path")]
    path: PathBuf,
    /// Optional entry inside `path` to archive instead of the whole of `path`.
    #[serde(default)]
    file: Option<String>,
    #[serde(default = "default_compress")]
    compress: bool,
    #[serde(default = "default_save_dir")]
    save_dir: PathBuf,
}

fn default_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_compress() -> bool {
    true
}

impl TarballSource {
    /// Archives `path`, gzip compressed, into the system temp directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            path: path.into(),
            file: None,
            compress: default_compress(),
            save_dir: default_save_dir(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
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

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            super::require_non_empty(name, "tarball name")?;
        }
        if let Some(file) = &self.file {
            super::require_non_empty(file, "tarball file")?;
        }
        Ok(())
    }

    /// The file or directory being backed up and restored.
    fn target(&self) -> PathBuf {
        match &self.file {
            Some(file) => self.path.join(file),
            None => self.path.clone(),
        }
    }

    fn backup_blocking(&self) -> Result<PathBuf> {
        let target = self.target();
        let target = target
            .canonicalize()
            .io_context(|| format!("cannot read backup target {}", target.display()))?;
        let root = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::Config(format!("cannot archive {}: no file name", target.display()))
            })?;
        let prefix = format!("{}-backup", self.name.as_deref().unwrap_or(&root));
        let extension = if self.compress { ".tar.gz" } else { ".tar" };
        let path = artifact::generate_path(&self.save_dir, &prefix, extension);

        let context = || format!("cannot create tarball on {}", path.display());
        let file = File::create(&path).io_context(context)?;
        if self.compress {
            let encoder = append(GzEncoder::new(file, Compression::default()), &target, &root)
                .io_context(context)?;
            encoder.finish().io_context(context)?;
        } else {
            append(file, &target, &root).io_context(context)?;
        }

        info!("Archived {} into {}", target.display(), path.display());
        Ok(path)
    }

    fn restore_blocking(&self, artifact: &Path) -> Result<()> {
        let format = ArchiveFormat::from_path(artifact).ok_or_else(|| {
            Error::UnsupportedFormat(
                artifact
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| artifact.display().to_string()),
            )
        })?;

        let file = File::open(artifact)
            .io_context(|| format!("cannot open file {}", artifact.display()))?;

        let target = self.target();
        if target.is_dir() {
            remove_directory_contents(&target)?;
        }

        let context = || format!("cannot unpack backup {}", artifact.display());
        match format {
            ArchiveFormat::Tar => unpack(file, &target).io_context(context)?,
            ArchiveFormat::TarGz => unpack(GzDecoder::new(file), &target).io_context(context)?,
        }

        info!("Restored {} into {}", artifact.display(), target.display());
        Ok(())
    }
}

#[async_trait]
impl Source for TarballSource {
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

/// Appends `target` to a tar stream with its entries rooted at `root`.
fn append<W: Write>(writer: W, target: &Path, root: &str) -> io::Result<W> {
    let mut builder = tar::Builder::new(writer);
    if target.is_dir() {
        builder.append_dir_all(root, target)?;
    } else {
        builder.append_path_with_name(target, root)?;
    }
    builder.into_inner()
}

/// Unpacks an archive written by [`append`] into `target`, dropping the root
/// component so the contents land directly in `target`.
fn unpack<R: Read>(reader: R, target: &Path) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        // archives written by `append` dereference links, so any link entry
        // is foreign and could redirect later entries outside `target`
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            return Err(unsafe_entry(&path));
        }

        let mut components = path.components();
        match components.next() {
            Some(Component::Normal(_)) => {}
            _ => return Err(unsafe_entry(&path)),
        }
        let relative = components.as_path().to_path_buf();
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(unsafe_entry(&path));
        }

        if relative.as_os_str().is_empty() {
            if entry.header().entry_type().is_dir() {
                fs::create_dir_all(target)?;
                continue;
            }
            // single file archive
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(target)?;
            continue;
        }

        let dest = target.join(&relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }
    Ok(())
}

fn unsafe_entry(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("refusing to unpack entry {}", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_archive_format_from_path() {
        assert_eq!(
            ArchiveFormat::from_path(Path::new("a-backup-20240101000000.tar")),
            Some(ArchiveFormat::Tar)
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("/tmp/a-backup-20240101000000.tar.gz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("a.tgz")),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(ArchiveFormat::from_path(Path::new("a.zip")), None);
        assert_eq!(ArchiveFormat::from_path(Path::new("a.sql.gz")), None);
    }

    #[test]
    fn test_target_joins_file() {
        let source = TarballSource::new("/srv/data");
        assert_eq!(source.target(), PathBuf::from("/srv/data"));
        let source = source.with_file("app.db");
        assert_eq!(source.target(), PathBuf::from("/srv/data/app.db"));
    }

    #[test]
    fn test_backup_name_uses_prefix() {
        let data = tempdir().unwrap();
        let saves = tempdir().unwrap();
        fs::write(data.path().join("a.txt"), "a").unwrap();

        let source = TarballSource::new(data.path())
            .with_name("site")
            .with_compress(false)
            .with_save_dir(saves.path());
        let path = source.backup_blocking().unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("site-backup-"));
        assert!(name.ends_with(".tar"));
        assert!(path.exists());
    }

    #[test]
    fn test_unsupported_extension_keeps_target() {
        let data = tempdir().unwrap();
        fs::write(data.path().join("keep.txt"), "keep").unwrap();
        let bogus = data.path().join("backup.zip");
        fs::write(&bogus, "not a tarball").unwrap();

        let source = TarballSource::new(data.path());
        let err = source.restore_blocking(&bogus).unwrap_err();

        assert!(matches!(err, Error::UnsupportedFormat(ref name) if name == "backup.zip"));
        assert!(data.path().join("keep.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_rejects_symlink_escape() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder
            .append_link(&mut link, "root/link", outside.path())
            .unwrap();

        let body = b"evil";
        let mut file = tar::Header::new_gnu();
        file.set_size(body.len() as u64);
        file.set_mode(0o644);
        builder
            .append_data(&mut file, "root/link/evil.txt", &body[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let target = dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        let err = unpack(&bytes[..], &target).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!outside.path().join("evil.txt").exists());
        assert!(fs::symlink_metadata(target.join("link")).is_err());
    }

    #[test]
    fn test_unpack_rejects_parent_components() {
        let dir = tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let body = b"evil";
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        // bypass the builder's own path validation
        {
            let name = b"root/../../evil.txt";
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name);
        }
        header.set_cksum();
        builder.append(&header, &body[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let err = unpack(&bytes[..], &dir.path().join("target")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!dir.path().join("evil.txt").exists());
    }
}

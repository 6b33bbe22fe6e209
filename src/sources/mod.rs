//! Data sources: things that can be dumped into an artifact and restored from one.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::warn;
use walkdir::WalkDir;

use crate::artifact;
use crate::command::CommandError;
use crate::error::IoContext;
use crate::{Error, Result};

mod consul;
mod mysql;
mod postgres;
mod tarball;

pub use consul::ConsulSource;
pub use mysql::MysqlSource;
pub use postgres::{PostgresSource, Programs as PostgresPrograms};
pub use tarball::TarballSource;

/// A backend that produces artifacts on backup and consumes them on restore.
#[async_trait]
pub trait Source: Send + Sync {
    /// Writes a new artifact and returns its local path.
    async fn backup(&self) -> Result<PathBuf>;

    /// Restores the data contained in the artifact at `path`.
    async fn restore(&self, path: &Path) -> Result<()>;
}

/// Where artifacts are written when no save directory is configured.
pub(crate) fn default_save_dir() -> PathBuf {
    std::env::temp_dir()
}

pub(crate) fn default_host() -> String {
    "localhost".to_string()
}

/// Splits free-form extra options on whitespace.
pub(crate) fn split_options(options: &str) -> Vec<String> {
    options.split_whitespace().map(str::to_owned).collect()
}

pub(crate) fn require_absolute(program: &Path) -> Result<()> {
    if program.is_absolute() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "program path {} must be absolute",
            program.display()
        )))
    }
}

pub(crate) fn require_non_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::Config(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

/// Creates `path` and hands a gzip writer over it to `dump`, finishing and
/// syncing the file once `dump` returns successfully. The file is removed
/// again when anything fails.
pub(crate) fn write_gzip<F>(path: &Path, dump: F) -> Result<()>
where
    F: FnOnce(&mut (dyn Write + Send)) -> Result<()>,
{
    let file =
        File::create(path).io_context(|| format!("cannot create file {}", path.display()))?;
    let written = (|| {
        let mut encoder = GzEncoder::new(file, Compression::default());
        dump(&mut encoder)?;
        encoder
            .finish()
            .and_then(|file| file.sync_all())
            .io_context(|| format!("cannot flush file {}", path.display()))
    })();
    discard_on_error(path, written)
}

/// Removes a partially written artifact when `result` is an error, so a failed
/// dump never shows up as the latest backup.
pub(crate) fn discard_on_error<T>(path: &Path, result: Result<T>) -> Result<T> {
    if result.is_err() {
        match fs::remove_file(path) {
            Ok(()) => warn!("Removed incomplete artifact {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove incomplete artifact {}: {err}", path.display()),
        }
    }
    result
}

/// Opens an artifact for reading, transparently gunzipping `.gz` files.
pub(crate) fn open_artifact(path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path).io_context(|| format!("cannot open file {}", path.display()))?;
    if artifact::is_gzip(path) {
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Applies the exit-code tolerance of a restore: a bare nonzero exit is
/// logged and ignored when `ignore_exit_code` is set. Spawn, wait and stream
/// failures are always errors.
pub(crate) fn check_restore(
    result: std::result::Result<(), CommandError>,
    ignore_exit_code: bool,
) -> Result<()> {
    match result {
        Err(err) if ignore_exit_code && err.is_exit_only() => {
            warn!("Ignored exit code of restore process: {err}");
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Removes everything inside `dir`, keeping `dir` itself.
pub(crate) fn remove_directory_contents(dir: &Path) -> Result<()> {
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry
            .map_err(std::io::Error::from)
            .io_context(|| format!("cannot read files on directory {}", dir.display()))?;
        let path = entry.path();
        let removed = if entry.file_type().is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        removed.io_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_split_options() {
        assert_eq!(
            split_options("  --single-transaction   --quick "),
            vec!["--single-transaction", "--quick"]
        );
        assert!(split_options("").is_empty());
    }

    #[test]
    fn test_remove_directory_contents_keeps_dir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/deeper/b.txt"), "b").unwrap();

        remove_directory_contents(dir.path()).unwrap();

        assert!(dir.path().is_dir());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_directory_contents_missing_dir() {
        let dir = tempdir().unwrap();
        let err = remove_directory_contents(&dir.path().join("missing")).unwrap_err();
        assert!(err.to_string().contains("cannot read files on directory"));
    }

    #[test]
    fn test_gzip_round_trip_through_open_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump-20240101000000.sql.gz");
        write_gzip(&path, |out| {
            out.write_all(b"CREATE TABLE t (id int);\n").unwrap();
            Ok(())
        })
        .unwrap();

        let mut text = String::new();
        open_artifact(&path)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "CREATE TABLE t (id int);\n");
    }

    #[test]
    fn test_failed_gzip_dump_leaves_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump-20240101000000.sql.gz");
        let err = write_gzip(&path, |out| {
            out.write_all(b"partial").unwrap();
            Err(Error::Config("dump failed".to_string()))
        })
        .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_discard_on_error_keeps_successful_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.sql");
        fs::write(&path, "ok").unwrap();

        discard_on_error(&path, Ok(())).unwrap();
        assert!(path.exists());

        let missing = dir.path().join("never-created.sql");
        assert!(discard_on_error::<()>(&missing, Err(Error::NotFound("x".into()))).is_err());

        assert!(discard_on_error::<()>(&path, Err(Error::NotFound("x".into()))).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_require_absolute() {
        assert!(require_absolute(Path::new("/usr/bin/mysqldump")).is_ok());
        assert!(matches!(
            require_absolute(Path::new("mysqldump")),
            Err(Error::Config(_))
        ));
    }
}

//! Artifact file names.
//!
//! Every artifact is named `<prefix>-<YYYYMMDDHHMMSS>[.ext]`. The timestamp is
//! fixed width and zero padded, so sorting names lexicographically sorts them
//! chronologically. Retention and latest-backup lookups rely on this.

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};

/// Timestamp layout used in artifact names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Builds an artifact file name for `prefix` at time `at`.
///
/// `extension` includes its leading dot, e.g. `.sql.gz`, or is empty.
pub fn artifact_name(prefix: &str, at: &NaiveDateTime, extension: &str) -> String {
    format!("{prefix}-{}{extension}", at.format(TIMESTAMP_FORMAT))
}

/// Returns a path in `dir` for a new artifact stamped with the current local time.
pub fn generate_path(dir: &Path, prefix: &str, extension: &str) -> PathBuf {
    dir.join(artifact_name(prefix, &Local::now().naive_local(), extension))
}

/// Whether the artifact at `path` is gzip compressed, judged by its name.
pub fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

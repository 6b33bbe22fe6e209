//! Logging setup for the binary, powered by tracing-subscriber.

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

/// Level used when neither `--log-level` nor `RUST_LOG` is set.
pub const DEFAULT_LEVEL: &str = "info";

/// Dependencies that log far more than a backup run cares about.
const NOISY: &[(&str, &str)] = &[
    ("aws_config", "warn"),
    ("aws_smithy_runtime", "warn"),
    ("aws_sdk_s3", "warn"),
    ("hyper", "warn"),
    ("hyper_util", "warn"),
    ("h2", "warn"),
    ("rustls", "warn"),
];

/// Builds the filter: an explicit `level` wins over `RUST_LOG`, which wins
/// over [`DEFAULT_LEVEL`]. Noisy crates are lowered unless named explicitly.
fn build_env_filter(level: Option<&str>) -> anyhow::Result<EnvFilter> {
    let base = match level {
        Some(level) => level.to_string(),
        None => std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_LEVEL.to_string()),
    };

    let mut directives: Vec<String> = NOISY
        .iter()
        .filter(|(target, _)| !base.contains(target))
        .map(|(target, level)| format!("{target}={level}"))
        .collect();
    directives.insert(0, base);

    let filter = directives.join(",");
    EnvFilter::try_new(&filter).map_err(|e| anyhow!("Invalid tracing filter '{filter}': {e}"))
}

/// Installs the global subscriber writing to stderr.
pub fn init(level: Option<&str>) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(level)?)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to install logger: {e}"))
}

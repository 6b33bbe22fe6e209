//! Consul source built on `consul snapshot`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{Source, default_save_dir, discard_on_error};
use crate::Result;
use crate::artifact;
use crate::command::CommandRunner;

/// Consul snapshot source, driving `consul snapshot save|restore`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsulSource {
    #[serde(default = "default_save_dir")]
    save_dir: PathBuf,
    #[serde(default = "default_consul_cmd")]
    consul_cmd: PathBuf,
}

fn default_consul_cmd() -> PathBuf {
    PathBuf::from("/bin/consul")
}

impl Default for ConsulSource {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            consul_cmd: default_consul_cmd(),
        }
    }
}

impl ConsulSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_save_dir(mut self, save_dir: impl Into<PathBuf>) -> Self {
        self.save_dir = save_dir.into();
        self
    }

    pub fn with_program(mut self, consul: impl Into<PathBuf>) -> Self {
        self.consul_cmd = consul.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        super::require_absolute(&self.consul_cmd)
    }

    fn snapshot(&self, action: &str, path: &Path) -> Result<()> {
        let args = vec![
            "snapshot".to_string(),
            action.to_string(),
            path.to_string_lossy().into_owned(),
        ];
        CommandRunner::new().run(&self.consul_cmd, &args)?;
        Ok(())
    }
}

#[async_trait]
impl Source for ConsulSource {
    async fn backup(&self) -> Result<PathBuf> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || {
            let path = artifact::generate_path(&source.save_dir, "consul-backup", ".snap");
            discard_on_error(&path, source.snapshot("save", &path))?;
            info!("Consul snapshot written to {}", path.display());
            Ok(path)
        })
        .await?
    }

    async fn restore(&self, path: &Path) -> Result<()> {
        let source = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || source.snapshot("restore", &path)).await?
    }
}

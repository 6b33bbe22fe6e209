//! S3 store, also usable against S3-compatible services through a custom endpoint.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{Store, expired, latest};
use crate::error::IoContext;
use crate::{Error, Result};

/// Keys per `DeleteObjects` request, the service maximum.
const DELETE_BATCH: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct S3Store {
    bucket: String,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    region: Option<String>,
    /// Custom endpoint for S3-compatible services.
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    force_path_style: bool,
    #[serde(default)]
    keep_after_upload: bool,
    #[serde(default = "crate::sources::default_save_dir")]
    save_dir: PathBuf,
    #[serde(skip)]
    client: OnceCell<Client>,
    /// Local copy left by the last retrieve, removed on close.
    #[serde(skip)]
    retrieved: Mutex<Option<PathBuf>>,
}

impl S3Store {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            region: None,
            endpoint: None,
            force_path_style: false,
            keep_after_upload: false,
            save_dir: crate::sources::default_save_dir(),
            client: OnceCell::new(),
            retrieved: Mutex::new(None),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, force_path_style: bool) -> Self {
        self.endpoint = Some(endpoint.into());
        self.force_path_style = force_path_style;
        self
    }

    pub fn with_keep_after_upload(mut self, keep: bool) -> Self {
        self.keep_after_upload = keep;
        self
    }

    pub fn with_save_dir(mut self, save_dir: impl Into<PathBuf>) -> Self {
        self.save_dir = save_dir.into();
        self
    }

    /// Uses an already configured client instead of building one from the environment.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = OnceCell::from(client);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(Error::Config("s3 store needs a bucket".to_string()));
        }
        Ok(())
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Some(region) = &self.region {
                    loader = loader.region(Region::new(region.clone()));
                }
                let shared = loader.load().await;

                let mut config = aws_sdk_s3::config::Builder::from(&shared)
                    .force_path_style(self.force_path_style);
                if let Some(endpoint) = &self.endpoint {
                    config = config.endpoint_url(endpoint);
                }
                Client::from_conf(config.build())
            })
            .await
    }

    fn key(&self, name: &str) -> String {
        let prefix = clean_prefix(&self.prefix);
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        }
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, clean_prefix(&self.prefix))
    }

    /// Every artifact key under the prefix, skipping directory markers.
    async fn list(&self) -> Result<Vec<String>> {
        let prefix = clean_prefix(&self.prefix);
        let mut request = self.client().await.list_objects_v2().bucket(&self.bucket);
        if !prefix.is_empty() {
            request = request.prefix(format!("{prefix}/"));
        }

        let mut keys = Vec::new();
        let mut pages = request.into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| remote("couldn't list S3 objects", err))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| !key.ends_with('/'))
                    .map(str::to_owned),
            );
        }
        Ok(keys)
    }

    async fn upload(&self, path: &Path, key: &str) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|err| remote(format!("failed to open file {}", path.display()), err))?;
        self.client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|err| remote("failed to upload file", err))?;
        info!("File uploaded to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<usize> {
        let objects = keys
            .iter()
            .map(|key| {
                debug!("Marked to delete: s3://{}/{key}", self.bucket);
                ObjectIdentifier::builder().key(key).build()
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| remote("couldn't build the delete request", err))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .map_err(|err| remote("couldn't build the delete request", err))?;

        let output = self
            .client()
            .await
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| remote("couldn't delete the S3 objects", err))?;

        for failed in output.errors() {
            warn!(
                "Failed to delete s3://{}/{}: {}",
                self.bucket,
                failed.key().unwrap_or_default(),
                failed.message().unwrap_or("unknown error")
            );
        }
        Ok(output.deleted().len())
    }

    fn take_retrieved(&self) -> Option<PathBuf> {
        self.retrieved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Store for S3Store {
    async fn store(&self, path: &Path, name: &str) -> Result<()> {
        let result = self.upload(path, &self.key(name)).await;

        if !self.keep_after_upload {
            info!("Removing source file {}", path.display());
            if let Err(err) = tokio::fs::remove_file(path).await {
                warn!("Cannot remove file {}: {err}", path.display());
            }
        }
        result
    }

    async fn retrieve(&self, name: &str) -> Result<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| Error::Config(format!("invalid S3 object key {name}")))?;
        let dest = self.save_dir.join(file_name);

        let response = self
            .client()
            .await
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|err| remote("failed to download S3 object", err))?;

        if let Err(err) = download(response.body, &dest).await {
            match tokio::fs::remove_file(&dest).await {
                Ok(()) => {}
                Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
                Err(rm) => warn!("Cannot remove partial download {}: {rm}", dest.display()),
            }
            return Err(err);
        }

        info!("File downloaded to {}", dest.display());
        let previous = self
            .retrieved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(dest.clone());
        if let Some(previous) = previous.filter(|previous| previous != &dest) {
            warn!("Replacing unreleased download {}", previous.display());
        }
        Ok(dest)
    }

    async fn remove_older_backups(&self, keep: usize) -> Result<()> {
        let doomed = expired(self.list().await?, keep);
        if doomed.is_empty() {
            return Ok(());
        }

        let mut deleted = 0;
        for batch in doomed.chunks(DELETE_BATCH) {
            deleted += self.delete_batch(batch).await?;
        }
        info!("Deleted {deleted} objects from S3");
        Ok(())
    }

    async fn find_latest_backup(&self) -> Result<String> {
        latest(self.list().await?).ok_or_else(|| Error::NotFound(self.location()))
    }

    async fn close(&self) {
        if let Some(path) = self.take_retrieved() {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!("Cannot remove file {}: {err}", path.display());
            }
        }
    }
}

async fn download(mut body: ByteStream, dest: &Path) -> Result<()> {
    let context = || format!("cannot write file {}", dest.display());
    let mut file = tokio::fs::File::create(dest).await.io_context(context)?;
    while let Some(chunk) = body
        .try_next()
        .await
        .map_err(|err| remote("failed to download S3 object", err))?
    {
        file.write_all(&chunk).await.io_context(context)?;
    }
    file.sync_all().await.io_context(context)?;
    Ok(())
}

fn remote<E>(context: impl Into<String>, err: E) -> Error
where
    E: std::error::Error,
{
    Error::Remote {
        context: context.into(),
        message: DisplayErrorContext(err).to_string(),
    }
}

/// Normalises a key prefix: no leading, trailing or doubled slashes, no `.` segments.
fn clean_prefix(prefix: &str) -> String {
    prefix
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

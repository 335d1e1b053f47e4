//! Local filesystem driver.
//!
//! Objects live beneath `base_path/{bucket}/{shard}/{shard}/{filename}`; the
//! two shard levels come from MD5(bucket/filename) and keep directory sizes small.

use async_trait::async_trait;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use super::{ObjectData, StorageDriver};
use crate::errors::{DriverError, DriverResult};

const MAX_FILENAME_LEN: usize = 255;

#[derive(Clone, Debug)]
pub struct LocalDriver {
    slug: String,
    base_path: PathBuf,
    base_url: String,
}

impl LocalDriver {
    pub fn new(slug: impl Into<String>, base_path: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            slug: slug.into(),
            base_path: base_path.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Rejects names that could escape the bucket directory.
    fn ensure_name_safe(name: &str) -> DriverResult<()> {
        if name.is_empty()
            || name.len() > MAX_FILENAME_LEN
            || name.contains("..")
            || name.contains('/')
            || name.bytes().any(|b| b.is_ascii_control() || b == b'\\')
        {
            return Err(DriverError::new(format!("unsafe object name `{}`", name)));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    fn object_shards(bucket: &str, filename: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, filename));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, filename: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, filename);
        self.bucket_root(bucket)
            .join(shard_a)
            .join(shard_b)
            .join(filename)
    }

    /// Remove empty shard directories up to (not including) the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Copy into a temp file beside the target, fsync, then rename into place.
    async fn object_create(&self, data: &ObjectData<'_>) -> DriverResult<()> {
        Self::ensure_name_safe(data.bucket)?;
        Self::ensure_name_safe(data.filename)?;

        let file_path = self.object_path(data.bucket, data.filename);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| DriverError::new("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let copied = async {
            fs::copy(data.source, &tmp_path).await?;
            let file = fs::File::open(&tmp_path).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &file_path).await
        }
        .await;

        if let Err(err) = copied {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(DriverError::new(format!(
                "could not store {}/{}: {}",
                data.bucket, data.filename, err
            )));
        }

        debug!("stored {} at {}", data.mime, file_path.display());
        Ok(())
    }

    async fn object_destroy(&self, filename: &str, bucket: &str) -> DriverResult<()> {
        Self::ensure_name_safe(bucket)?;
        Self::ensure_name_safe(filename)?;

        let file_path = self.object_path(bucket, filename);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root(bucket)).await;
        }
        Ok(())
    }

    async fn object_exists(&self, filename: &str, bucket: &str) -> DriverResult<bool> {
        Self::ensure_name_safe(bucket)?;
        Self::ensure_name_safe(filename)?;
        Ok(fs::try_exists(self.object_path(bucket, filename)).await?)
    }

    async fn object_local_path(
        &self,
        bucket: &str,
        filename: &str,
    ) -> DriverResult<Option<PathBuf>> {
        Self::ensure_name_safe(bucket)?;
        Self::ensure_name_safe(filename)?;
        let path = self.object_path(bucket, filename);
        if fs::try_exists(&path).await? {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    async fn bucket_create(&self, slug: &str) -> DriverResult<()> {
        Self::ensure_name_safe(slug)?;
        fs::create_dir_all(self.bucket_root(slug)).await?;
        Ok(())
    }

    async fn bucket_destroy(&self, slug: &str) -> DriverResult<()> {
        Self::ensure_name_safe(slug)?;
        match fs::remove_dir_all(self.bucket_root(slug)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

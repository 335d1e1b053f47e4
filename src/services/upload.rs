//! Upload pipeline: stage bytes, dedup by content hash, validate against the
//! bucket policy, persist through the default driver and write the row.
//!
//! Every source is first staged into a local file (a `LocalFile` source is
//! used in place). Staging files are `TempPath`s, removed on drop whatever
//! the outcome.

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut, stream::BoxStream};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tempfile::TempPath;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{
    bucket_store::BucketStore, image_transformer, is_unique_violation, mime_registry,
    object_store::ObjectStore, request_cache::RequestCache,
};
use crate::{
    drivers::{DriverRegistry, ObjectData},
    errors::{CdnError, CdnResult, ValidationError},
    models::{
        bucket::NewBucket,
        object::{ImageInfo, NewObject, Object},
    },
};

/// Leading bytes kept for content sniffing.
const SNIFF_LEN: usize = 8192;

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub staging_dir: PathBuf,
    /// Hard cap on any upload, independent of bucket policy. Zero disables it.
    pub max_upload_bytes: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join("object-cdn-staging"),
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Where the bytes of an upload come from.
pub enum UploadSource {
    /// A multipart form field, already read.
    Multipart {
        file_name: Option<String>,
        content_type: Option<String>,
        data: Bytes,
    },
    /// A file already on local disk. It is read, never moved or removed.
    LocalFile(PathBuf),
    /// A raw body with its declared content type.
    Stream {
        data: BoxStream<'static, io::Result<Bytes>>,
        content_type: Option<String>,
    },
    /// Fetched over HTTP(S) and then treated like a stream.
    RemoteUrl(String),
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Target bucket id or slug. Unknown slugs are created without restrictions.
    pub bucket: String,
    /// Display filename; defaults to the name the source carries.
    pub filename: Option<String>,
    pub extension: Option<String>,
    pub mime: Option<String>,
    pub min_width: Option<u32>,
    pub max_width: Option<u32>,
    pub min_height: Option<u32>,
    pub max_height: Option<u32>,
    pub user: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub object: Object,
    /// The bytes were already stored in this bucket; no new row was written.
    pub duplicate: bool,
}

/// A local copy of the upload plus what was learned while reading it.
struct Staged {
    path: PathBuf,
    _temp: Option<TempPath>,
    source_name: Option<String>,
    declared_mime: Option<String>,
    size: u64,
    hash: String,
    head: Vec<u8>,
}

struct Intake {
    size: u64,
    digest: md5::Context,
    head: Vec<u8>,
}

impl Intake {
    fn new() -> Self {
        Self {
            size: 0,
            digest: md5::Context::new(),
            head: Vec::new(),
        }
    }

    fn consume(&mut self, chunk: &[u8]) {
        self.size += chunk.len() as u64;
        if self.head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
        }
        self.digest.consume(chunk);
    }
}

#[derive(Clone)]
pub struct UploadPipeline {
    objects: ObjectStore,
    buckets: BucketStore,
    drivers: Arc<DriverRegistry>,
    settings: UploadSettings,
    http: reqwest::Client,
}

impl UploadPipeline {
    pub fn new(
        objects: ObjectStore,
        buckets: BucketStore,
        drivers: Arc<DriverRegistry>,
        settings: UploadSettings,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            objects,
            buckets,
            drivers,
            settings,
            http,
        }
    }

    pub async fn upload(
        &self,
        ctx: &RequestCache,
        source: UploadSource,
        opts: UploadOptions,
    ) -> CdnResult<UploadOutcome> {
        let staged = self.stage(source).await?;
        if staged.size == 0 {
            return Err(ValidationError::NoFile.into());
        }

        let display_filename = opts
            .filename
            .as_deref()
            .or(staged.source_name.as_deref())
            .map(base_name)
            .filter(|name| !name.is_empty());

        // Extension: explicit > from the filename > from the MIME type.
        let ext_hint = opts
            .extension
            .as_deref()
            .map(mime_registry::sanitize_extension)
            .filter(|ext| !ext.is_empty())
            .or_else(|| display_filename.as_deref().and_then(mime_registry::extension_of));

        // MIME: explicit > sniffed > declared by the transport > from the extension.
        let mime = match opts.mime.clone() {
            Some(mime) => mime,
            None => match mime_registry::sniff(&staged.head) {
                Some(detected) => {
                    mime_registry::refine_detected(Some(detected), ext_hint.as_deref().unwrap_or(""))
                }
                None => staged.declared_mime.clone().unwrap_or_else(|| {
                    mime_registry::mime_for_extension(ext_hint.as_deref().unwrap_or("")).to_string()
                }),
            },
        };

        let ext = match ext_hint {
            Some(ext) => ext,
            None => mime_registry::extension_for_mime(&mime)
                .map(str::to_string)
                .map_err(|_| ValidationError::MissingExtension)?,
        };

        let bucket = self.buckets.get(ctx, &opts.bucket).await?;
        if let Some(bucket) = &bucket {
            if let Some(existing) = self.objects.get_by_content_hash(&staged.hash, bucket.id).await? {
                debug!(id = existing.id, bucket = %bucket.slug, "upload matches existing object");
                return self.reuse(ctx, existing.id, opts.user).await;
            }
        }

        if !mime_registry::is_extension_valid_for_mime(&ext, &mime) {
            return Err(ValidationError::ExtensionMimeMismatch { ext, mime }.into());
        }

        let bucket = match bucket {
            Some(bucket) => bucket,
            None if opts.bucket.parse::<i64>().is_ok() => {
                return Err(CdnError::NotFound(format!("bucket #{}", opts.bucket)));
            }
            None => {
                let new = NewBucket {
                    created_by: opts.user,
                    ..NewBucket::unrestricted(opts.bucket.clone())
                };
                self.buckets.create(ctx, &new).await?
            }
        };

        if !BucketStore::is_extension_allowed(&ext, &bucket) {
            return Err(ValidationError::ExtensionNotAllowed {
                ext,
                allowed: bucket.allowed_extensions.join(", "),
            }
            .into());
        }
        if bucket.max_size_bytes > 0 && staged.size > bucket.max_size_bytes as u64 {
            return Err(ValidationError::TooLarge {
                size: staged.size,
                max: bucket.max_size_bytes as u64,
            }
            .into());
        }

        let image = if mime_registry::is_image_mime(&mime) {
            let bytes = fs::read(&staged.path).await?;
            let info = image_transformer::probe(&bytes);
            if let Some(info) = &info {
                check_dimensions(info, &opts)?;
            }
            info
        } else {
            None
        };

        let filename = disk_filename(opts.user, &ext);
        let driver = self.drivers.default_driver();
        driver
            .object_create(&ObjectData {
                bucket: &bucket.slug,
                filename: &filename,
                mime: &mime,
                source: &staged.path,
            })
            .await
            .map_err(|err| CdnError::driver("store", format!("{}/{}", bucket.slug, filename), err))?;

        let new = NewObject {
            bucket_id: bucket.id,
            display_filename: display_filename
                .map(str::to_string)
                .unwrap_or_else(|| filename.clone()),
            filename: filename.clone(),
            mime,
            size_bytes: staged.size as i64,
            content_hash: staged.hash.clone(),
            driver: driver.slug().to_string(),
            image,
            created_by: opts.user,
        };

        let id = match self.objects.create(&new).await {
            Ok(id) => id,
            Err(err) => {
                if let Err(cleanup) = driver.object_destroy(&filename, &bucket.slug).await {
                    warn!(bucket = %bucket.slug, filename, "failed to remove stored bytes: {}", cleanup);
                }
                // A concurrent upload of the same bytes committed first.
                if let CdnError::Sqlx(sqlx_err) = &err {
                    if is_unique_violation(sqlx_err) {
                        if let Some(existing) =
                            self.objects.get_by_content_hash(&staged.hash, bucket.id).await?
                        {
                            return self.reuse(ctx, existing.id, opts.user).await;
                        }
                    }
                }
                return Err(err);
            }
        };

        let object = self
            .objects
            .get(ctx, &id.to_string(), None)
            .await?
            .ok_or_else(|| CdnError::NotFound(format!("object #{}", id)))?;
        info!(id, bucket = %bucket.slug, filename = %object.filename, size = object.size_bytes, "object uploaded");
        Ok(UploadOutcome {
            object,
            duplicate: false,
        })
    }

    async fn reuse(&self, ctx: &RequestCache, id: i64, user: Option<i64>) -> CdnResult<UploadOutcome> {
        self.objects.touch(ctx, id, user).await?;
        let object = self
            .objects
            .get(ctx, &id.to_string(), None)
            .await?
            .ok_or_else(|| CdnError::NotFound(format!("object #{}", id)))?;
        Ok(UploadOutcome {
            object,
            duplicate: true,
        })
    }

    async fn stage(&self, source: UploadSource) -> CdnResult<Staged> {
        match source {
            UploadSource::Multipart {
                file_name,
                content_type,
                data,
            } => {
                if data.is_empty() && file_name.as_deref().is_none_or(str::is_empty) {
                    return Err(ValidationError::NoFile.into());
                }
                let stream = futures::stream::once(async move { Ok::<_, io::Error>(data) });
                self.stage_stream(stream, file_name, content_type).await
            }
            UploadSource::LocalFile(path) => self.stage_local(path).await,
            UploadSource::Stream { data, content_type } => {
                self.stage_stream(data, None, content_type).await
            }
            UploadSource::RemoteUrl(url) => self.stage_remote(&url).await,
        }
    }

    async fn stage_stream<S>(
        &self,
        stream: S,
        source_name: Option<String>,
        declared_mime: Option<String>,
    ) -> CdnResult<Staged>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        fs::create_dir_all(&self.settings.staging_dir).await?;
        let temp = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(&self.settings.staging_dir)?
            .into_temp_path();
        let mut file = File::create(&temp).await?;

        let max = self.settings.max_upload_bytes;
        let mut intake = Intake::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| ValidationError::Upload(err.to_string()))?;
            intake.consume(&chunk);
            if max > 0 && intake.size > max {
                return Err(ValidationError::TooLarge {
                    size: intake.size,
                    max,
                }
                .into());
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(Staged {
            path: temp.to_path_buf(),
            _temp: Some(temp),
            source_name,
            declared_mime,
            size: intake.size,
            hash: format!("{:x}", intake.digest.compute()),
            head: intake.head,
        })
    }

    async fn stage_local(&self, path: PathBuf) -> CdnResult<Staged> {
        let file = File::open(&path).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => CdnError::Validation(ValidationError::NoFile),
            _ => CdnError::Io(err),
        })?;

        let mut intake = Intake::new();
        let mut chunks = ReaderStream::new(file);
        while let Some(chunk) = chunks.next().await {
            intake.consume(&chunk?);
        }

        let max = self.settings.max_upload_bytes;
        if max > 0 && intake.size > max {
            return Err(ValidationError::TooLarge {
                size: intake.size,
                max,
            }
            .into());
        }

        Ok(Staged {
            source_name: path.file_name().and_then(|n| n.to_str()).map(str::to_string),
            path,
            _temp: None,
            declared_mime: None,
            size: intake.size,
            hash: format!("{:x}", intake.digest.compute()),
            head: intake.head,
        })
    }

    async fn stage_remote(&self, url: &str) -> CdnResult<Staged> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|err| ValidationError::Upload(format!("invalid URL `{}`: {}", url, err)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ValidationError::Upload(format!(
                "unsupported URL scheme `{}`",
                parsed.scheme()
            ))
            .into());
        }

        let response = self
            .http
            .get(parsed.clone())
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|err| ValidationError::Upload(format!("could not fetch {}: {}", url, err)))?;

        let declared_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let source_name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let body = futures::stream::try_unfold(response, |mut response| async move {
            match response.chunk().await {
                Ok(Some(chunk)) => Ok(Some((chunk, response))),
                Ok(None) => Ok(None),
                Err(err) => Err(io::Error::other(err)),
            }
        });
        self.stage_stream(body, source_name, declared_mime).await
    }
}

fn check_dimensions(info: &ImageInfo, opts: &UploadOptions) -> Result<(), ValidationError> {
    let fail = |reason: String| ValidationError::BadDimensions {
        width: info.width,
        height: info.height,
        reason,
    };
    if let Some(min) = opts.min_width.filter(|min| info.width < *min) {
        return Err(fail(format!("it must be at least {} pixels wide", min)));
    }
    if let Some(max) = opts.max_width.filter(|max| info.width > *max) {
        return Err(fail(format!("it must be at most {} pixels wide", max)));
    }
    if let Some(min) = opts.min_height.filter(|min| info.height < *min) {
        return Err(fail(format!("it must be at least {} pixels tall", min)));
    }
    if let Some(max) = opts.max_height.filter(|max| info.height > *max) {
        return Err(fail(format!("it must be at most {} pixels tall", max)));
    }
    Ok(())
}

/// Opaque disk name, never derived from the uploader's filename.
fn disk_filename(user: Option<i64>, ext: &str) -> String {
    let now = Utc::now();
    let seed = format!(
        "{}{}{}",
        user.unwrap_or_default(),
        now.timestamp_micros(),
        rand::random::<u64>()
    );
    format!("{}-{:x}.{}", now.timestamp(), md5::compute(seed), ext)
}

fn base_name(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name)
        .trim()
}

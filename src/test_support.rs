//! Shared test fixtures: generated images, an instrumented storage driver and
//! a `Harness` wiring every service over a throwaway SQLite file.

use async_trait::async_trait;
use image::{
    Delay, DynamicImage, Frame, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage,
    codecs::gif::{GifEncoder, Repeat},
};
use std::{
    collections::HashSet,
    io::Cursor,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    db,
    drivers::{DriverRegistry, LocalDriver, ObjectData, StorageDriver},
    errors::{DriverError, DriverResult},
    models::{
        bucket::{Bucket, NewBucket},
        object::{NewObject, Object},
    },
    services::{
        bucket_store::BucketStore,
        image_transformer, mime_registry,
        object_store::{ObjectFilter, ObjectStore},
        orphans::OrphanFinder,
        request_cache::{Location, RequestCache},
        transform_cache::{TransformCache, TransformSettings},
        trash::TrashLifecycle,
        upload::{UploadPipeline, UploadSettings},
    },
    state::AppState,
};

fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    })
}

fn encoded(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    buf
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    encoded(DynamicImage::ImageRgb8(gradient(width, height)), ImageFormat::Jpeg)
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encoded(DynamicImage::ImageRgb8(gradient(width, height)), ImageFormat::Png)
}

/// A looping GIF whose frames differ in colour, each shown for `delay_ms`.
pub fn animated_gif_bytes(frames: usize, width: u32, height: u32, delay_ms: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        encoder.set_repeat(Repeat::Infinite).unwrap();
        let frames = (0..frames).map(|i| {
            let shade = (i * 40 % 256) as u8;
            let img = RgbaImage::from_fn(width, height, |x, _| {
                if x < width / 2 {
                    Rgba([shade, 0x20, 0xff - shade, 0xff])
                } else {
                    Rgba([0xff - shade, shade, 0x20, 0xff])
                }
            });
            Frame::from_parts(img, 0, 0, Delay::from_numer_denom_ms(delay_ms, 1))
        });
        encoder.encode_frames(frames).unwrap();
    }
    buf
}

/// `LocalDriver` with call counters and failure injection.
pub struct MockDriver {
    inner: LocalDriver,
    scratch: PathBuf,
    calls: AtomicUsize,
    object_creates: AtomicUsize,
    bucket_creates: AtomicUsize,
    evictions: AtomicUsize,
    empty_reads: AtomicUsize,
    fail_bucket_create: AtomicBool,
    fail_destroy: Mutex<HashSet<String>>,
    stored: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn new(storage: impl Into<PathBuf>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            inner: LocalDriver::new("local", storage, "http://cdn.test"),
            scratch: scratch.into(),
            calls: AtomicUsize::new(0),
            object_creates: AtomicUsize::new(0),
            bucket_creates: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            empty_reads: AtomicUsize::new(0),
            fail_bucket_create: AtomicBool::new(false),
            fail_destroy: Mutex::new(HashSet::new()),
            stored: Mutex::new(Vec::new()),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn object_creates(&self) -> usize {
        self.object_creates.load(Ordering::SeqCst)
    }

    pub fn bucket_creates(&self) -> usize {
        self.bucket_creates.load(Ordering::SeqCst)
    }

    /// Filenames passed to `object_create`, in call order.
    pub fn stored_filenames(&self) -> Vec<String> {
        self.stored.lock().unwrap().clone()
    }

    pub fn evictions(&self) -> usize {
        self.evictions.load(Ordering::SeqCst)
    }

    /// The next `n` local-path lookups hand out an empty file.
    pub fn empty_reads(&self, n: usize) {
        self.empty_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_bucket_create(&self, fail: bool) {
        self.fail_bucket_create.store(fail, Ordering::SeqCst);
    }

    /// Destroying `filename` fails from now on.
    pub fn fail_destroy(&self, filename: &str) {
        self.fail_destroy.lock().unwrap().insert(filename.to_string());
    }

    pub async fn has_bytes(&self, bucket: &str, filename: &str) -> bool {
        self.inner.object_exists(filename, bucket).await.unwrap()
    }

    /// Delete stored bytes behind the database's back.
    pub async fn remove_bytes(&self, bucket: &str, filename: &str) {
        self.inner.object_destroy(filename, bucket).await.unwrap();
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn take_empty_read(&self) -> bool {
        self.empty_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StorageDriver for MockDriver {
    fn slug(&self) -> &str {
        self.inner.slug()
    }

    fn base_url(&self) -> &str {
        self.inner.base_url()
    }

    async fn object_create(&self, data: &ObjectData<'_>) -> DriverResult<()> {
        self.count();
        self.object_creates.fetch_add(1, Ordering::SeqCst);
        self.stored.lock().unwrap().push(data.filename.to_string());
        self.inner.object_create(data).await
    }

    async fn object_destroy(&self, filename: &str, bucket: &str) -> DriverResult<()> {
        self.count();
        if self.fail_destroy.lock().unwrap().contains(filename) {
            return Err(DriverError::new(format!("injected failure destroying {}", filename)));
        }
        self.inner.object_destroy(filename, bucket).await
    }

    async fn object_exists(&self, filename: &str, bucket: &str) -> DriverResult<bool> {
        self.count();
        self.inner.object_exists(filename, bucket).await
    }

    async fn object_local_path(&self, bucket: &str, filename: &str) -> DriverResult<Option<PathBuf>> {
        self.count();
        if self.take_empty_read() {
            std::fs::create_dir_all(&self.scratch)?;
            let empty = self.scratch.join(format!("empty-{}", Uuid::new_v4()));
            std::fs::write(&empty, b"")?;
            return Ok(Some(empty));
        }
        self.inner.object_local_path(bucket, filename).await
    }

    async fn evict_local_copy(&self, _bucket: &str, _filename: &str) -> DriverResult<()> {
        self.count();
        self.evictions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn bucket_create(&self, slug: &str) -> DriverResult<()> {
        self.count();
        if self.fail_bucket_create.load(Ordering::SeqCst) {
            return Err(DriverError::new(format!("injected failure creating {}", slug)));
        }
        self.bucket_creates.fetch_add(1, Ordering::SeqCst);
        self.inner.bucket_create(slug).await
    }

    async fn bucket_destroy(&self, slug: &str) -> DriverResult<()> {
        self.count();
        self.inner.bucket_destroy(slug).await
    }
}

/// Every service over a fresh database, storage root and cache directory.
pub struct Harness {
    pub state: AppState,
    pub objects: ObjectStore,
    pub buckets: BucketStore,
    pub trash: TrashLifecycle,
    pub uploads: UploadPipeline,
    pub transforms: TransformCache,
    pub orphans: OrphanFinder,
    pub driver: Arc<MockDriver>,
    dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(Self::transform_settings(), None).await
    }

    /// Transform settings used by `new`; the cache dir is replaced per harness.
    pub fn transform_settings() -> TransformSettings {
        TransformSettings::default()
    }

    pub async fn with_settings(settings: TransformSettings) -> Self {
        Self::build(settings, None).await
    }

    pub async fn with_admin_token(token: &str) -> Self {
        Self::build(Self::transform_settings(), Some(token.to_string())).await
    }

    async fn build(mut settings: TransformSettings, admin_token: Option<String>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["cache", "staging", "scratch", "objects"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        settings.cache_dir = root.join("cache");

        let database_url = format!("sqlite://{}", root.join("cdn.db").display());
        let pool = db::connect(&database_url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let driver = Arc::new(MockDriver::new(root.join("objects"), root.join("scratch")));
        let drivers = DriverRegistry::new(driver.clone()).unwrap();
        let config = AppConfig {
            storage_dir: root.join("objects").display().to_string(),
            cache_dir: root.join("cache").display().to_string(),
            database_url,
            base_url: "http://cdn.test".into(),
            private_key: "test-private-key".into(),
            admin_token,
            max_age_secs: 3600,
            ..AppConfig::default()
        };
        let upload = UploadSettings {
            staging_dir: root.join("staging"),
            max_upload_bytes: 8 * 1024 * 1024,
        };
        let state = AppState::with_settings(config, Arc::new(pool), drivers, settings, upload);

        Self {
            objects: state.objects.clone(),
            buckets: state.buckets.clone(),
            trash: state.trash.clone(),
            uploads: state.uploads.clone(),
            transforms: state.transforms.clone(),
            orphans: state.orphans.clone(),
            state,
            driver,
            dir,
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    pub async fn object_count(&self) -> i64 {
        self.objects
            .count(Location::Live, &ObjectFilter::default())
            .await
            .unwrap()
    }

    pub async fn seed_bucket(&self, slug: &str) -> Bucket {
        self.buckets
            .create(&RequestCache::new(), &NewBucket::unrestricted(slug))
            .await
            .unwrap()
    }

    /// Store `bytes` under exactly `filename` and insert its row.
    ///
    /// The content hash mixes in the name so equal fixture bytes can be
    /// seeded twice into one bucket.
    pub async fn seed_object(&self, bucket: &str, filename: &str, bytes: &[u8]) -> Object {
        let bucket = self.seed_bucket(bucket).await;
        let source = self.scratch_dir().join(format!("seed-{}", Uuid::new_v4()));
        std::fs::write(&source, bytes).unwrap();

        let ext = mime_registry::extension_of(filename).unwrap_or_default();
        let mime = mime_registry::mime_for_extension(&ext).to_string();
        self.driver
            .inner
            .object_create(&ObjectData {
                bucket: &bucket.slug,
                filename,
                mime: &mime,
                source: &source,
            })
            .await
            .unwrap();
        std::fs::remove_file(&source).unwrap();

        let image = if mime_registry::is_image_mime(&mime) {
            image_transformer::probe(bytes)
        } else {
            None
        };
        let mut digest = md5::Context::new();
        digest.consume(filename.as_bytes());
        digest.consume(bytes);

        let id = self
            .objects
            .create(&NewObject {
                bucket_id: bucket.id,
                filename: filename.to_string(),
                display_filename: filename.to_string(),
                mime,
                size_bytes: bytes.len() as i64,
                content_hash: format!("{:x}", digest.compute()),
                driver: self.driver.slug().to_string(),
                image,
                created_by: None,
            })
            .await
            .unwrap();
        self.objects
            .get(&RequestCache::new(), &id.to_string(), None)
            .await
            .unwrap()
            .unwrap()
    }
}


//! TransformCache resolves a rendition request to a file on disk, rendering
//! it at most once per cache key.
//!
//! Resolution is split in two so the HTTP layer can answer conditional
//! requests in between: `prepare` validates the request and derives the cache
//! key without touching storage, `resolve` serves the cached file or renders
//! a new one. Renders run on the blocking pool behind a semaphore, are
//! serialised per key, and land on disk through a temp file and a rename.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{fs, sync::Semaphore, time::timeout};
use tracing::{debug, error, warn};

use super::{
    image_transformer::{self, FitMode, RenderJob},
    object_store::ObjectStore,
    rendition::{CacheKey, RenditionDir, parse_retina},
    request_cache::RequestCache,
};
use crate::{
    drivers::DriverRegistry,
    errors::{CdnResult, TransformError, ValidationError},
    models::{
        object::{CropQuadrant, Object, Orientation},
        rendition::TransformKind,
    },
};

#[derive(Debug, Clone)]
pub struct TransformSettings {
    pub cache_dir: PathBuf,
    /// Permitted `(width, height)` pairs, checked before any retina multiplier.
    pub allowed_dimensions: Vec<(u32, u32)>,
    pub allow_dangerous_transforms: bool,
    /// Crop anchor per orientation; missing entries mean centre.
    pub quadrants: HashMap<Orientation, CropQuadrant>,
    pub max_retina: u32,
    pub workers: usize,
    pub queue_timeout: Duration,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("object-cdn-cache"),
            allowed_dimensions: vec![(50, 50), (100, 100), (200, 200)],
            allow_dangerous_transforms: false,
            quadrants: HashMap::new(),
            max_retina: 3,
            workers: 2,
            queue_timeout: Duration::from_secs(10),
        }
    }
}

impl TransformSettings {
    pub fn is_permitted(&self, width: u32, height: u32) -> bool {
        self.allow_dangerous_transforms || self.allowed_dimensions.contains(&(width, height))
    }

    fn quadrant_for(&self, orientation: Option<Orientation>) -> CropQuadrant {
        orientation
            .and_then(|o| self.quadrants.get(&o).copied())
            .unwrap_or_default()
    }

    fn uses_quadrants(&self) -> bool {
        self.quadrants.values().any(|q| *q != CropQuadrant::Center)
    }
}

/// A transform request as it arrives from a URL.
#[derive(Debug, Clone, Copy)]
pub struct RenditionRequest<'a> {
    pub bucket: &'a str,
    /// Requested filename, possibly carrying an `@Nx` retina suffix.
    pub filename: &'a str,
    pub kind: TransformKind,
    pub width: u32,
    pub height: u32,
    /// Fall back to trashed objects when the live lookup misses.
    pub allow_trash: bool,
}

/// A validated request with its cache key.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub key: CacheKey,
    pub bucket: String,
    pub filename: String,
    pub kind: TransformKind,
    /// Target size after the retina multiplier.
    pub width: u32,
    pub height: u32,
    pub quadrant: CropQuadrant,
    allow_trash: bool,
    object: Option<Object>,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    /// Served from a rendition already on disk.
    Hit { path: PathBuf, key: CacheKey },
    /// Rendered by this request.
    Miss { path: PathBuf, key: CacheKey },
    /// The source is absent, unreadable or could not be transformed.
    BadSource {
        width: u32,
        height: u32,
        reason: String,
    },
}

type RenderFn = Box<dyn FnOnce() -> Result<Vec<u8>, TransformError> + Send>;

#[derive(Clone)]
pub struct TransformCache {
    objects: ObjectStore,
    drivers: Arc<DriverRegistry>,
    renditions: RenditionDir,
    settings: Arc<TransformSettings>,
    permits: Arc<Semaphore>,
    locks: Arc<Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>>,
    renders: Arc<AtomicU64>,
}

impl TransformCache {
    pub fn new(objects: ObjectStore, drivers: Arc<DriverRegistry>, settings: TransformSettings) -> Self {
        Self {
            objects,
            drivers,
            renditions: RenditionDir::new(&settings.cache_dir),
            permits: Arc::new(Semaphore::new(settings.workers.max(1))),
            settings: Arc::new(settings),
            locks: Arc::default(),
            renders: Arc::default(),
        }
    }

    pub fn settings(&self) -> &TransformSettings {
        &self.settings
    }

    pub fn renditions(&self) -> &RenditionDir {
        &self.renditions
    }

    /// Number of renders performed by this cache since startup.
    pub fn render_count(&self) -> u64 {
        self.renders.load(Ordering::Relaxed)
    }

    /// Validate the request and derive its cache key.
    ///
    /// Rejects sizes outside the allow-list before any database or driver
    /// access. Renditions are always keyed by the stored disk filename, so a
    /// request by numeric id shares the entry that trash invalidation clears.
    pub async fn prepare(&self, ctx: &RequestCache, req: RenditionRequest<'_>) -> CdnResult<Prepared> {
        if !self.settings.is_permitted(req.width, req.height) {
            return Err(ValidationError::BadDimensions {
                width: req.width,
                height: req.height,
                reason: "that size is not permitted".into(),
            }
            .into());
        }
        if req.width == 0 || req.height == 0 {
            return Err(ValidationError::BadDimensions {
                width: req.width,
                height: req.height,
                reason: "both sides must be positive".into(),
            }
            .into());
        }

        let (filename, retina) = parse_retina(req.filename, self.settings.max_retina);
        let width = req.width.saturating_mul(retina);
        let height = req.height.saturating_mul(retina);

        // Ids, trash access and orientation-dependent crops all need the row
        // before the key can be named.
        let by_id = filename.parse::<i64>().is_ok();
        let quadrants = req.kind.fills_box() && self.settings.uses_quadrants();
        let object = if by_id || req.allow_trash || quadrants {
            self.find_object(ctx, req.bucket, &filename, req.allow_trash)
                .await?
        } else {
            None
        };
        let filename = match &object {
            Some(object) if by_id => object.filename.clone(),
            _ => filename,
        };
        let quadrant = if quadrants {
            self.settings
                .quadrant_for(object.as_ref().and_then(Object::orientation))
        } else {
            CropQuadrant::Center
        };

        let bucket = object
            .as_ref()
            .map_or(req.bucket, |object| object.bucket.slug.as_str())
            .to_string();
        let mut key = CacheKey::for_object(&bucket, &filename, req.kind, width, height, quadrant);
        if object.as_ref().is_some_and(Object::is_trashed) {
            key = key.from_trash();
        }
        Ok(Prepared {
            key,
            bucket,
            filename,
            kind: req.kind,
            width,
            height,
            quadrant,
            allow_trash: req.allow_trash,
            object,
        })
    }

    /// Serve the rendition from disk or render it from the source object.
    pub async fn resolve(&self, ctx: &RequestCache, prepared: &Prepared) -> CdnResult<Resolution> {
        let path = self.renditions.path_for(&prepared.key);
        if fs::try_exists(&path).await? {
            self.bump(prepared, None).await;
            return Ok(Resolution::Hit {
                path,
                key: prepared.key.clone(),
            });
        }

        let lock = self.key_lock(&prepared.key);
        let _guard = lock.lock().await;
        // Another request may have rendered it while we waited.
        if fs::try_exists(&path).await? {
            self.bump(prepared, None).await;
            return Ok(Resolution::Hit {
                path,
                key: prepared.key.clone(),
            });
        }

        let bad = |reason: String| Resolution::BadSource {
            width: prepared.width,
            height: prepared.height,
            reason,
        };

        let object = match &prepared.object {
            Some(object) => Some(object.clone()),
            None => {
                self.find_object(ctx, &prepared.bucket, &prepared.filename, prepared.allow_trash)
                    .await?
            }
        };
        let Some(object) = object else {
            return Ok(bad(format!("{}/{} not found", prepared.bucket, prepared.filename)));
        };
        if !object.is_image() {
            return Ok(bad(format!("{}/{} is not an image", prepared.bucket, prepared.filename)));
        }

        let source = match self.fetch_source(&object).await {
            Ok(bytes) => bytes,
            Err(reason) => return Ok(bad(reason)),
        };

        let job = RenderJob {
            mode: if prepared.kind.fills_box() {
                FitMode::Fill(prepared.quadrant)
            } else {
                FitMode::Fit
            },
            width: prepared.width,
            height: prepared.height,
            format: prepared.key.format(),
        };
        let render: RenderFn = Box::new(move || image_transformer::render(&source, &job));
        if let Err(reason) = self.render_to_disk(&prepared.key, render).await {
            return Ok(bad(reason));
        }

        self.bump(prepared, Some(&object)).await;
        Ok(Resolution::Miss {
            path,
            key: prepared.key.clone(),
        })
    }

    /// Serve or produce a generated image (placeholder, blank avatar).
    pub async fn resolve_generated<F>(
        &self,
        key: CacheKey,
        width: u32,
        height: u32,
        render: F,
    ) -> CdnResult<Resolution>
    where
        F: FnOnce() -> Result<Vec<u8>, TransformError> + Send + 'static,
    {
        if !self.settings.is_permitted(width, height) {
            return Err(ValidationError::BadDimensions {
                width,
                height,
                reason: "that size is not permitted".into(),
            }
            .into());
        }

        let path = self.renditions.path_for(&key);
        if fs::try_exists(&path).await? {
            return Ok(Resolution::Hit { path, key });
        }

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;
        if fs::try_exists(&path).await? {
            return Ok(Resolution::Hit { path, key });
        }

        match self.render_to_disk(&key, Box::new(render)).await {
            Ok(()) => Ok(Resolution::Miss { path, key }),
            Err(reason) => Ok(Resolution::BadSource {
                width,
                height,
                reason,
            }),
        }
    }

    async fn find_object(
        &self,
        ctx: &RequestCache,
        bucket: &str,
        filename: &str,
        allow_trash: bool,
    ) -> CdnResult<Option<Object>> {
        if let Some(object) = self.objects.get(ctx, filename, Some(bucket)).await? {
            return Ok(Some(object));
        }
        if allow_trash {
            return self.objects.get_from_trash(ctx, filename, Some(bucket)).await;
        }
        Ok(None)
    }

    /// Source bytes through the object's driver. A zero-length local copy is
    /// evicted and fetched once more before giving up.
    async fn fetch_source(&self, object: &Object) -> Result<Vec<u8>, String> {
        let bucket = object.bucket.slug.as_str();
        let filename = object.filename.as_str();
        let driver = self.drivers.get(&object.driver).map_err(|err| err.to_string())?;

        for attempt in 0..2 {
            let path = match driver.object_local_path(bucket, filename).await {
                Ok(Some(path)) => path,
                Ok(None) => return Err(format!("{}/{} is missing from storage", bucket, filename)),
                Err(err) => {
                    warn!(bucket, filename, "driver fetch failed: {}", err);
                    return Err(err.to_string());
                }
            };

            let len = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            if len > 0 {
                return fs::read(&path).await.map_err(|err| err.to_string());
            }

            warn!(bucket, filename, attempt, "source fetched with zero length");
            if let Err(err) = driver.evict_local_copy(bucket, filename).await {
                warn!(bucket, filename, "could not evict local copy: {}", err);
            }
        }
        Err(format!("{}/{} is empty", bucket, filename))
    }

    /// Run `render` on the blocking pool and move its output into place.
    async fn render_to_disk(&self, key: &CacheKey, render: RenderFn) -> Result<(), String> {
        let permit = match timeout(self.settings.queue_timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err("transform pool is closed".into()),
            Err(_) => {
                warn!(key = %key, "timed out waiting for a transform worker");
                return Err("transform queue is full".into());
            }
        };

        self.renders.fetch_add(1, Ordering::Relaxed);
        let rendered = tokio::task::spawn_blocking(render).await;
        drop(permit);

        let bytes = match rendered {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                warn!(key = %key, "transform failed: {}", err);
                return Err(err.to_string());
            }
            Err(err) => {
                error!(key = %key, "transform task aborted: {}", err);
                return Err("transform aborted".into());
            }
        };

        if let Err(err) = self.write_atomically(key, &bytes).await {
            error!(key = %key, "failed to store rendition: {}", err);
            return Err("rendition could not be stored".into());
        }
        debug!(key = %key, size = bytes.len(), "rendition stored");
        Ok(())
    }

    async fn write_atomically(&self, key: &CacheKey, bytes: &[u8]) -> std::io::Result<()> {
        self.renditions.ensure().await?;
        let temp = self.renditions.temp_path_for(key);
        if let Err(err) = fs::write(&temp, bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&temp, self.renditions.path_for(key)).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }
        Ok(())
    }

    async fn bump(&self, prepared: &Prepared, object: Option<&Object>) {
        let Some(counter) = prepared.kind.counter() else {
            return;
        };
        match object {
            Some(object) => {
                self.objects
                    .increment_counter(counter, &object.id.to_string(), None)
                    .await
            }
            None => {
                self.objects
                    .increment_counter(counter, &prepared.filename, Some(&prepared.bucket))
                    .await
            }
        }
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(key.file_name()).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(key.file_name().to_string(), Arc::downgrade(&lock));
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::CdnError,
        models::object::CounterKind,
        test_support::{Harness, animated_gif_bytes, jpeg_bytes, png_bytes},
    };
    use image::{AnimationDecoder, codecs::gif::GifDecoder};
    use std::io::Cursor;

    fn crop(bucket: &'static str, filename: &'static str, w: u32, h: u32) -> RenditionRequest<'static> {
        RenditionRequest {
            bucket,
            filename,
            kind: TransformKind::Crop,
            width: w,
            height: h,
            allow_trash: false,
        }
    }

    async fn thumbs(h: &Harness, id: i64) -> i64 {
        h.objects
            .get(&RequestCache::new(), &id.to_string(), None)
            .await
            .unwrap()
            .unwrap()
            .counters
            .thumbs
    }

    #[tokio::test]
    async fn second_request_is_a_hit_without_rendering() {
        let h = Harness::new().await;
        let object = h.seed_object("photos", "sunset.jpg", &jpeg_bytes(300, 200)).await;
        let ctx = RequestCache::new();

        let prepared = h.transforms.prepare(&ctx, crop("photos", "sunset.jpg", 100, 100)).await.unwrap();
        assert_eq!(prepared.key.file_name(), "photos-sunset-CROP-100x100.jpg");

        let first = h.transforms.resolve(&ctx, &prepared).await.unwrap();
        let Resolution::Miss { path, .. } = first else {
            panic!("expected a miss, got {first:?}");
        };
        assert_eq!(path, h.cache_dir().join("photos-sunset-CROP-100x100.jpg"));
        let rendered = std::fs::read(&path).unwrap();
        assert_eq!(thumbs(&h, object.id).await, 1);

        let second = h.transforms.resolve(&ctx, &prepared).await.unwrap();
        assert!(matches!(second, Resolution::Hit { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), rendered);
        assert_eq!(thumbs(&h, object.id).await, 2);
        assert_eq!(h.transforms.render_count(), 1);
    }

    #[tokio::test]
    async fn disallowed_size_never_reaches_storage() {
        let h = Harness::new().await;
        h.seed_object("photos", "sunset.jpg", &jpeg_bytes(300, 200)).await;
        let calls_before = h.driver.total_calls();

        let err = h
            .transforms
            .prepare(&RequestCache::new(), crop("photos", "sunset.jpg", 123, 77))
            .await
            .unwrap_err();
        assert!(matches!(err, CdnError::Validation(ValidationError::BadDimensions { .. })));
        assert_eq!(h.driver.total_calls(), calls_before);
    }

    #[tokio::test]
    async fn retina_multiplies_the_target_size() {
        let h = Harness::new().await;
        h.seed_object("photos", "sunset.jpg", &jpeg_bytes(300, 300)).await;
        let ctx = RequestCache::new();

        let prepared = h
            .transforms
            .prepare(&ctx, crop("photos", "sunset@2x.jpg", 100, 100))
            .await
            .unwrap();
        assert_eq!(prepared.key.file_name(), "photos-sunset-CROP-200x200.jpg");
        let Resolution::Miss { path, .. } = h.transforms.resolve(&ctx, &prepared).await.unwrap() else {
            panic!("expected a miss");
        };
        let img = image::open(path).unwrap();
        assert_eq!((img.width(), img.height()), (200, 200));
    }

    #[tokio::test]
    async fn orientation_quadrant_enters_the_key() {
        let mut settings = Harness::transform_settings();
        settings.quadrants.insert(Orientation::Portrait, CropQuadrant::Top);
        let h = Harness::with_settings(settings).await;
        h.seed_object("photos", "tall.jpg", &jpeg_bytes(100, 300)).await;
        h.seed_object("photos", "wide.jpg", &jpeg_bytes(300, 100)).await;
        let ctx = RequestCache::new();

        let tall = h.transforms.prepare(&ctx, crop("photos", "tall.jpg", 100, 100)).await.unwrap();
        let wide = h.transforms.prepare(&ctx, crop("photos", "wide.jpg", 100, 100)).await.unwrap();
        assert_eq!(tall.key.file_name(), "photos-tall-CROP-100x100-T.jpg");
        assert_eq!(wide.key.file_name(), "photos-wide-CROP-100x100.jpg");
    }

    #[tokio::test]
    async fn missing_object_is_a_bad_source_without_counters() {
        let h = Harness::new().await;
        let ctx = RequestCache::new();
        let prepared = h.transforms.prepare(&ctx, crop("photos", "ghost.jpg", 100, 100)).await.unwrap();
        let resolution = h.transforms.resolve(&ctx, &prepared).await.unwrap();
        assert!(matches!(
            resolution,
            Resolution::BadSource {
                width: 100,
                height: 100,
                ..
            }
        ));
        assert_eq!(h.transforms.render_count(), 0);
    }

    #[tokio::test]
    async fn trashed_sources_need_permission() {
        let h = Harness::new().await;
        let object = h.seed_object("photos", "old.jpg", &jpeg_bytes(120, 120)).await;
        h.trash.delete(&RequestCache::new(), object.id, None).await.unwrap();

        let ctx = RequestCache::new();
        let denied = h.transforms.prepare(&ctx, crop("photos", "old.jpg", 100, 100)).await.unwrap();
        assert!(matches!(
            h.transforms.resolve(&ctx, &denied).await.unwrap(),
            Resolution::BadSource { .. }
        ));

        let allowed = h
            .transforms
            .prepare(
                &ctx,
                RenditionRequest {
                    allow_trash: true,
                    ..crop("photos", "old.jpg", 100, 100)
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            h.transforms.resolve(&ctx, &allowed).await.unwrap(),
            Resolution::Miss { .. }
        ));
    }

    #[tokio::test]
    async fn empty_first_fetch_is_retried_once() {
        let h = Harness::new().await;
        h.seed_object("photos", "flaky.jpg", &jpeg_bytes(120, 120)).await;
        h.driver.empty_reads(1);
        let ctx = RequestCache::new();

        let prepared = h.transforms.prepare(&ctx, crop("photos", "flaky.jpg", 100, 100)).await.unwrap();
        assert!(matches!(
            h.transforms.resolve(&ctx, &prepared).await.unwrap(),
            Resolution::Miss { .. }
        ));
        assert_eq!(h.driver.evictions(), 1);
    }

    #[tokio::test]
    async fn persistently_empty_source_gives_up() {
        let h = Harness::new().await;
        h.seed_object("photos", "hollow.jpg", &jpeg_bytes(120, 120)).await;
        h.driver.empty_reads(5);
        let ctx = RequestCache::new();

        let prepared = h.transforms.prepare(&ctx, crop("photos", "hollow.jpg", 100, 100)).await.unwrap();
        assert!(matches!(
            h.transforms.resolve(&ctx, &prepared).await.unwrap(),
            Resolution::BadSource { .. }
        ));
        assert_eq!(h.driver.evictions(), 2);
    }

    #[tokio::test]
    async fn corrupt_source_degrades_to_bad_source() {
        let h = Harness::new().await;
        // Header intact, pixel data damaged.
        let mut bytes = png_bytes(120, 120);
        let mid = bytes.len() / 2;
        for byte in &mut bytes[mid..mid + 16] {
            *byte = !*byte;
        }
        h.seed_object("photos", "broken.png", &bytes).await;
        let ctx = RequestCache::new();

        let prepared = h.transforms.prepare(&ctx, crop("photos", "broken.png", 100, 100)).await.unwrap();
        assert!(matches!(
            h.transforms.resolve(&ctx, &prepared).await.unwrap(),
            Resolution::BadSource { .. }
        ));
        assert!(!h.cache_dir().join(prepared.key.file_name()).exists());
    }

    #[tokio::test]
    async fn animated_scale_keeps_every_frame() {
        let h = Harness::new().await;
        let object = h
            .seed_object("photos", "spinner.gif", &animated_gif_bytes(5, 100, 100, 100))
            .await;
        assert!(object.image.unwrap().is_animated);
        let ctx = RequestCache::new();

        let prepared = h
            .transforms
            .prepare(
                &ctx,
                RenditionRequest {
                    kind: TransformKind::Scale,
                    ..crop("photos", "spinner.gif", 50, 50)
                },
            )
            .await
            .unwrap();
        let Resolution::Miss { path, .. } = h.transforms.resolve(&ctx, &prepared).await.unwrap() else {
            panic!("expected a miss");
        };

        let out = std::fs::read(&path).unwrap();
        let frames = GifDecoder::new(Cursor::new(out))
            .unwrap()
            .into_frames()
            .collect_frames()
            .unwrap();
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| f.delay().numer_denom_ms() == (100, 1)));

        let files = std::fs::read_dir(h.cache_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(files, vec!["photos-spinner-SCALE-50x50.gif".to_string()]);

        let scales = h
            .objects
            .get(&ctx, &object.id.to_string(), None)
            .await
            .unwrap()
            .unwrap()
            .counters
            .scales;
        assert_eq!(scales, 1);
    }

    #[tokio::test]
    async fn concurrent_misses_render_once() {
        let h = Harness::new().await;
        h.seed_object("photos", "busy.jpg", &jpeg_bytes(400, 400)).await;
        let prepared = h
            .transforms
            .prepare(&RequestCache::new(), crop("photos", "busy.jpg", 200, 200))
            .await
            .unwrap();

        let tasks = (0..4)
            .map(|_| {
                let cache = h.transforms.clone();
                let prepared = prepared.clone();
                tokio::spawn(async move { cache.resolve(&RequestCache::new(), &prepared).await })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            assert!(!matches!(task.await.unwrap().unwrap(), Resolution::BadSource { .. }));
        }
        assert_eq!(h.transforms.render_count(), 1);
    }

    #[tokio::test]
    async fn counters_follow_the_kind() {
        let h = Harness::new().await;
        let object = h.seed_object("photos", "pic.jpg", &jpeg_bytes(200, 200)).await;
        let ctx = RequestCache::new();
        for kind in [TransformKind::Thumb, TransformKind::Scale] {
            let prepared = h
                .transforms
                .prepare(&ctx, RenditionRequest { kind, ..crop("photos", "pic.jpg", 100, 100) })
                .await
                .unwrap();
            h.transforms.resolve(&ctx, &prepared).await.unwrap();
        }
        h.objects
            .increment_counter(CounterKind::Crop, "pic.jpg", Some("photos"))
            .await;

        let counters = h
            .objects
            .get(&RequestCache::new(), &object.id.to_string(), None)
            .await
            .unwrap()
            .unwrap()
            .counters;
        assert_eq!((counters.thumbs, counters.scales), (2, 1));
    }

    #[tokio::test]
    async fn generated_images_are_cached() {
        let h = Harness::new().await;
        let key = CacheKey::placeholder(100, 100, 2);
        let first = h
            .transforms
            .resolve_generated(key.clone(), 100, 100, || image_transformer::placeholder(100, 100, 2))
            .await
            .unwrap();
        let second = h
            .transforms
            .resolve_generated(key, 100, 100, || image_transformer::placeholder(100, 100, 2))
            .await
            .unwrap();
        assert!(matches!(first, Resolution::Miss { .. }));
        assert!(matches!(second, Resolution::Hit { .. }));
        assert_eq!(h.transforms.render_count(), 1);
    }

    #[tokio::test]
    async fn id_requests_share_the_filename_key_and_die_with_the_object() {
        let h = Harness::new().await;
        let object = h.seed_object("photos", "sunset.jpg", &jpeg_bytes(300, 200)).await;
        let id = object.id.to_string();
        let by_id = RenditionRequest {
            filename: &id,
            ..crop("photos", "sunset.jpg", 100, 100)
        };

        let prepared = h.transforms.prepare(&RequestCache::new(), by_id).await.unwrap();
        assert_eq!(prepared.key.file_name(), "photos-sunset-CROP-100x100.jpg");
        assert_eq!(prepared.key.format(), image_transformer::OutputFormat::Jpeg);
        let first = h.transforms.resolve(&RequestCache::new(), &prepared).await.unwrap();
        assert!(matches!(first, Resolution::Miss { .. }));

        h.trash.destroy(&RequestCache::new(), object.id, None).await.unwrap();

        let ctx = RequestCache::new();
        let prepared = h.transforms.prepare(&ctx, by_id).await.unwrap();
        let after = h.transforms.resolve(&ctx, &prepared).await.unwrap();
        assert!(matches!(after, Resolution::BadSource { .. }), "got {after:?}");
        assert!(!h.cache_dir().join("photos-sunset-CROP-100x100.jpg").exists());
    }

    #[tokio::test]
    async fn trashed_renders_never_reach_the_public_key() {
        let h = Harness::new().await;
        let object = h.seed_object("photos", "gone.jpg", &jpeg_bytes(300, 200)).await;
        h.trash.delete(&RequestCache::new(), object.id, None).await.unwrap();

        let ctx = RequestCache::new();
        let admin = RenditionRequest {
            allow_trash: true,
            ..crop("photos", "gone.jpg", 100, 100)
        };
        let prepared = h.transforms.prepare(&ctx, admin).await.unwrap();
        assert_eq!(prepared.key.file_name(), "photos-gone-CROP-100x100-TRASHED.jpg");
        let rendered = h.transforms.resolve(&ctx, &prepared).await.unwrap();
        assert!(matches!(rendered, Resolution::Miss { .. }));

        let ctx = RequestCache::new();
        let public = h
            .transforms
            .prepare(&ctx, crop("photos", "gone.jpg", 100, 100))
            .await
            .unwrap();
        assert_eq!(public.key.file_name(), "photos-gone-CROP-100x100.jpg");
        let served = h.transforms.resolve(&ctx, &public).await.unwrap();
        assert!(matches!(served, Resolution::BadSource { .. }), "got {served:?}");

        // Purging clears the trash-side rendition too.
        h.trash.purge(&RequestCache::new(), Some(&[object.id][..])).await.unwrap();
        assert!(!h.cache_dir().join("photos-gone-CROP-100x100-TRASHED.jpg").exists());
    }
}

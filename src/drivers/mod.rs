//! Storage driver contract and registry.
//!
//! A driver owns the bytes of objects; the database owns everything else.
//! Drivers are registered once at startup under a slug, and every object row
//! records the slug of the driver holding its bytes.

pub mod local;

use async_trait::async_trait;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    errors::{CdnError, CdnResult, DriverResult},
    models::rendition::AvatarSex,
};

pub use local::LocalDriver;

/// Bytes to persist for a new object.
#[derive(Debug, Clone)]
pub struct ObjectData<'a> {
    pub bucket: &'a str,
    pub filename: &'a str,
    pub mime: &'a str,
    /// Local file holding the bytes; the driver copies it and never removes it.
    pub source: &'a Path,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Registry identifier, recorded on every object row.
    fn slug(&self) -> &str;

    /// Public URL prefix used by the URL helpers.
    fn base_url(&self) -> &str;

    async fn object_create(&self, data: &ObjectData<'_>) -> DriverResult<()>;

    /// Permanently remove an object's bytes. Removing bytes that are already gone succeeds.
    async fn object_destroy(&self, filename: &str, bucket: &str) -> DriverResult<()>;

    async fn object_exists(&self, filename: &str, bucket: &str) -> DriverResult<bool>;

    /// A local filesystem path holding the object's bytes, or `None` when absent.
    async fn object_local_path(&self, bucket: &str, filename: &str)
    -> DriverResult<Option<PathBuf>>;

    /// Drop any local copy made by `object_local_path` so the next call refetches.
    async fn evict_local_copy(&self, _bucket: &str, _filename: &str) -> DriverResult<()> {
        Ok(())
    }

    async fn bucket_create(&self, slug: &str) -> DriverResult<()>;

    async fn bucket_destroy(&self, slug: &str) -> DriverResult<()>;

    fn url_serve_scheme(&self) -> String {
        format!("{}/serve/{{bucket}}/{{filename}}", self.base_url())
    }

    fn url_crop_scheme(&self) -> String {
        format!(
            "{}/crop/{{width}}/{{height}}/{{bucket}}/{{filename}}",
            self.base_url()
        )
    }

    fn url_scale_scheme(&self) -> String {
        format!(
            "{}/scale/{{width}}/{{height}}/{{bucket}}/{{filename}}",
            self.base_url()
        )
    }

    fn url_placeholder_scheme(&self) -> String {
        format!(
            "{}/placeholder/{{width}}/{{height}}/{{border}}",
            self.base_url()
        )
    }

    fn url_blank_avatar_scheme(&self) -> String {
        format!(
            "{}/blank_avatar/{{width}}/{{height}}/{{sex}}",
            self.base_url()
        )
    }

    fn url_expiring_scheme(&self) -> String {
        format!("{}?token={{token}}", self.url_serve_scheme())
    }

    fn url_serve(&self, bucket: &str, filename: &str, force_download: bool) -> String {
        let url = fill(
            &self.url_serve_scheme(),
            &[("bucket", bucket), ("filename", filename)],
        );
        if force_download {
            format!("{}?dl=1", url)
        } else {
            url
        }
    }

    fn url_crop(&self, bucket: &str, filename: &str, width: u32, height: u32) -> String {
        fill(
            &self.url_crop_scheme(),
            &[
                ("width", &width.to_string()),
                ("height", &height.to_string()),
                ("bucket", bucket),
                ("filename", filename),
            ],
        )
    }

    fn url_scale(&self, bucket: &str, filename: &str, width: u32, height: u32) -> String {
        fill(
            &self.url_scale_scheme(),
            &[
                ("width", &width.to_string()),
                ("height", &height.to_string()),
                ("bucket", bucket),
                ("filename", filename),
            ],
        )
    }

    fn url_placeholder(&self, width: u32, height: u32, border: u32) -> String {
        fill(
            &self.url_placeholder_scheme(),
            &[
                ("width", &width.to_string()),
                ("height", &height.to_string()),
                ("border", &border.to_string()),
            ],
        )
    }

    fn url_blank_avatar(&self, width: u32, height: u32, sex: AvatarSex) -> String {
        fill(
            &self.url_blank_avatar_scheme(),
            &[
                ("width", &width.to_string()),
                ("height", &height.to_string()),
                ("sex", sex.as_str()),
            ],
        )
    }

    fn url_expiring(&self, bucket: &str, filename: &str, token: &str) -> String {
        fill(
            &self.url_expiring_scheme(),
            &[("bucket", bucket), ("filename", filename), ("token", token)],
        )
    }
}

fn fill(scheme: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(scheme.to_string(), |url, (name, value)| {
            url.replace(&format!("{{{}}}", name), value)
        })
}

/// Drivers available to this process, keyed by slug.
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn StorageDriver>>,
    default_slug: String,
}

impl DriverRegistry {
    /// Build a registry whose default driver is `default`.
    pub fn new(default: Arc<dyn StorageDriver>) -> CdnResult<Self> {
        let slug = validate_slug(default.as_ref())?;
        let mut drivers = HashMap::new();
        drivers.insert(slug.clone(), default);
        Ok(Self {
            drivers,
            default_slug: slug,
        })
    }

    pub fn register(&mut self, driver: Arc<dyn StorageDriver>) -> CdnResult<()> {
        let slug = validate_slug(driver.as_ref())?;
        if self.drivers.contains_key(&slug) {
            return Err(CdnError::Conflict(format!(
                "storage driver `{}` is already registered",
                slug
            )));
        }
        tracing::info!(driver = %slug, "registered storage driver");
        self.drivers.insert(slug, driver);
        Ok(())
    }

    pub fn get(&self, slug: &str) -> CdnResult<Arc<dyn StorageDriver>> {
        self.drivers
            .get(slug)
            .cloned()
            .ok_or_else(|| CdnError::UnknownDriver(slug.to_string()))
    }

    pub fn default_driver(&self) -> Arc<dyn StorageDriver> {
        // The default is inserted in `new` and never removed.
        Arc::clone(&self.drivers[&self.default_slug])
    }

    pub fn default_slug(&self) -> &str {
        &self.default_slug
    }
}

fn validate_slug(driver: &dyn StorageDriver) -> CdnResult<String> {
    let slug = driver.slug().trim();
    if slug.is_empty() {
        return Err(CdnError::Conflict(
            "storage driver slug must not be empty".into(),
        ));
    }
    Ok(slug.to_string())
}

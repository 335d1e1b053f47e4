//! Shared router state: every service, built once at startup and cloned per request.

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{
    config::AppConfig,
    drivers::DriverRegistry,
    services::{
        bucket_store::BucketStore,
        object_store::ObjectStore,
        orphans::OrphanFinder,
        signed_url::UrlSigner,
        transform_cache::{TransformCache, TransformSettings},
        trash::TrashLifecycle,
        upload::{UploadPipeline, UploadSettings},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<SqlitePool>,
    pub drivers: Arc<DriverRegistry>,
    pub objects: ObjectStore,
    pub buckets: BucketStore,
    pub uploads: UploadPipeline,
    pub transforms: TransformCache,
    pub trash: TrashLifecycle,
    pub orphans: OrphanFinder,
    pub signer: UrlSigner,
}

impl AppState {
    pub fn new(config: AppConfig, db: Arc<SqlitePool>, drivers: DriverRegistry) -> Self {
        let transform = config.transform_settings();
        let upload = config.upload_settings();
        Self::with_settings(config, db, drivers, transform, upload)
    }

    pub fn with_settings(
        config: AppConfig,
        db: Arc<SqlitePool>,
        drivers: DriverRegistry,
        transform: TransformSettings,
        upload: UploadSettings,
    ) -> Self {
        let drivers = Arc::new(drivers);
        let objects = ObjectStore::new(db.clone());
        let transforms = TransformCache::new(objects.clone(), drivers.clone(), transform);
        let trash = TrashLifecycle::new(
            objects.clone(),
            drivers.clone(),
            transforms.renditions().clone(),
        );
        let buckets = BucketStore::new(db.clone(), drivers.clone(), objects.clone(), trash.clone());
        let uploads = UploadPipeline::new(objects.clone(), buckets.clone(), drivers.clone(), upload);
        let orphans = OrphanFinder::new(objects.clone(), drivers.clone());
        let signer = UrlSigner::new(&config.private_key);

        Self {
            config: Arc::new(config),
            db,
            drivers,
            objects,
            buckets,
            uploads,
            transforms,
            trash,
            orphans,
            signer,
        }
    }

    /// Open when no admin token is configured.
    pub fn is_admin_token(&self, presented: Option<&str>) -> bool {
        match self.config.admin_token.as_deref() {
            None => true,
            Some(expected) => presented.is_some_and(|token| token == expected),
        }
    }
}

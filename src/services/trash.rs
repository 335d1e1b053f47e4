//! Soft-delete lifecycle: LIVE → TRASHED → LIVE, TRASHED → GONE, and the
//! composed LIVE → GONE destroy.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    object_store::ObjectStore, rendition::RenditionDir, request_cache::RequestCache,
};
use crate::{
    drivers::DriverRegistry,
    errors::{CdnError, CdnResult},
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PurgeFailure {
    pub id: i64,
    pub reason: String,
}

/// Per-item outcome of a purge.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub purged: Vec<i64>,
    pub failed: Vec<PurgeFailure>,
}

impl PurgeReport {
    /// True only when every requested item was purged.
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct TrashLifecycle {
    objects: ObjectStore,
    drivers: Arc<DriverRegistry>,
    renditions: RenditionDir,
}

impl TrashLifecycle {
    pub fn new(objects: ObjectStore, drivers: Arc<DriverRegistry>, renditions: RenditionDir) -> Self {
        Self {
            objects,
            drivers,
            renditions,
        }
    }

    /// Move a live object to the trash and drop its cached renditions.
    pub async fn delete(&self, ctx: &RequestCache, id: i64, user: Option<i64>) -> CdnResult<()> {
        let object = self
            .objects
            .get(ctx, &id.to_string(), None)
            .await?
            .ok_or_else(|| CdnError::NotFound(format!("object #{}", id)))?;

        self.objects.move_to_trash(id, user).await?;
        ctx.forget_object(id);
        self.renditions
            .invalidate_object(&object.bucket.slug, &object.filename)
            .await;

        info!(id, bucket = %object.bucket.slug, filename = %object.filename, "object trashed");
        Ok(())
    }

    /// Bring a trashed object back. Renditions are rebuilt on demand.
    pub async fn restore(&self, ctx: &RequestCache, id: i64, user: Option<i64>) -> CdnResult<()> {
        self.objects.restore_from_trash(id, user).await?;
        ctx.forget_object(id);
        info!(id, "object restored from trash");
        Ok(())
    }

    /// Permanently remove trashed objects: `None` empties the whole trash.
    ///
    /// Keeps going past individual failures; an item whose bytes could not be
    /// destroyed stays in the trash.
    pub async fn purge(&self, ctx: &RequestCache, ids: Option<&[i64]>) -> CdnResult<PurgeReport> {
        let ids = match ids {
            Some(ids) => ids.to_vec(),
            None => self.objects.trashed_ids(None).await?,
        };

        let mut report = PurgeReport::default();
        for id in ids {
            match self.purge_one(ctx, id).await {
                Ok(()) => report.purged.push(id),
                Err(err) => {
                    warn!(id, "purge failed: {}", err);
                    report.failed.push(PurgeFailure {
                        id,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            purged = report.purged.len(),
            failed = report.failed.len(),
            "trash purge finished"
        );
        Ok(report)
    }

    async fn purge_one(&self, ctx: &RequestCache, id: i64) -> CdnResult<()> {
        let object = self
            .objects
            .get_from_trash(ctx, &id.to_string(), None)
            .await?
            .ok_or_else(|| CdnError::NotFound(format!("trashed object #{}", id)))?;

        let driver = self.drivers.get(&object.driver)?;
        driver
            .object_destroy(&object.filename, &object.bucket.slug)
            .await
            .map_err(|err| {
                CdnError::driver(
                    "destroy",
                    format!("{}/{}", object.bucket.slug, object.filename),
                    err,
                )
            })?;

        self.objects.purge(id).await?;
        ctx.forget_object(id);
        self.renditions
            .invalidate_object(&object.bucket.slug, &object.filename)
            .await;
        Ok(())
    }

    /// Delete then purge. An object that is already in the trash is purged directly.
    pub async fn destroy(&self, ctx: &RequestCache, id: i64, user: Option<i64>) -> CdnResult<()> {
        match self.delete(ctx, id, user).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.purge_one(ctx, id).await
    }
}

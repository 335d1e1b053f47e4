//! Diagnostic scan for live rows whose bytes are gone from storage.

use futures::StreamExt;
use serde::Serialize;
use std::{sync::Arc, time::Instant};
use tracing::{info, warn};

use super::object_store::ObjectStore;
use crate::{drivers::DriverRegistry, errors::CdnResult, models::object::Object};

#[derive(Debug, Clone, Serialize)]
pub struct OrphanReport {
    pub orphans: Vec<Object>,
    pub scanned: u64,
    /// Rows the driver could not answer for; not counted as orphans.
    pub errors: u64,
    pub elapsed_ms: u128,
}

#[derive(Clone)]
pub struct OrphanFinder {
    objects: ObjectStore,
    drivers: Arc<DriverRegistry>,
}

impl OrphanFinder {
    pub fn new(objects: ObjectStore, drivers: Arc<DriverRegistry>) -> Self {
        Self { objects, drivers }
    }

    /// Walk every live row through a cursor and ask its driver whether the bytes exist.
    pub async fn find(&self) -> CdnResult<OrphanReport> {
        let started = Instant::now();
        let mut orphans = Vec::new();
        let (mut scanned, mut errors) = (0u64, 0u64);

        let mut rows = self.objects.stream_live();
        while let Some(object) = rows.next().await {
            let object = object?;
            scanned += 1;

            let driver = match self.drivers.get(&object.driver) {
                Ok(driver) => driver,
                Err(err) => {
                    warn!(id = object.id, "{}", err);
                    errors += 1;
                    continue;
                }
            };
            match driver.object_exists(&object.filename, &object.bucket.slug).await {
                Ok(true) => {}
                Ok(false) => orphans.push(object),
                Err(err) => {
                    warn!(id = object.id, bucket = %object.bucket.slug, filename = %object.filename, "existence check failed: {}", err);
                    errors += 1;
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis();
        info!(scanned, orphans = orphans.len(), errors, elapsed_ms, "orphan scan finished");
        Ok(OrphanReport {
            orphans,
            scanned,
            errors,
            elapsed_ms,
        })
    }
}

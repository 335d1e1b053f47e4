//! BucketStore: bucket lookups, idempotent creation and full teardown.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    is_unique_violation, mime_registry, object_store::ObjectStore, request_cache::RequestCache,
    trash::TrashLifecycle,
};
use crate::{
    drivers::DriverRegistry,
    errors::{CdnError, CdnResult, ValidationError},
    models::bucket::{Bucket, BucketRow, NewBucket},
};

const SLUG_MIN_LEN: usize = 3;
const SLUG_MAX_LEN: usize = 63;

const SELECT_BUCKET: &str = "SELECT id, slug, label, allowed_extensions, max_size_bytes, \
     NULL AS object_count, created, created_by, modified, modified_by FROM buckets";

#[derive(Clone)]
pub struct BucketStore {
    db: Arc<SqlitePool>,
    drivers: Arc<DriverRegistry>,
    objects: ObjectStore,
    trash: TrashLifecycle,
}

impl BucketStore {
    pub fn new(
        db: Arc<SqlitePool>,
        drivers: Arc<DriverRegistry>,
        objects: ObjectStore,
        trash: TrashLifecycle,
    ) -> Self {
        Self {
            db,
            drivers,
            objects,
            trash,
        }
    }

    /// Look up a bucket by numeric id or slug. A miss is `Ok(None)`.
    pub async fn get(&self, ctx: &RequestCache, id_or_slug: &str) -> CdnResult<Option<Bucket>> {
        if let Some(hit) = ctx.bucket(id_or_slug) {
            return Ok(Some(hit));
        }

        let row: Option<BucketRow> = match id_or_slug.parse::<i64>() {
            Ok(id) => {
                sqlx::query_as(&format!("{} WHERE id = ?", SELECT_BUCKET))
                    .bind(id)
                    .fetch_optional(&*self.db)
                    .await?
            }
            Err(_) => {
                sqlx::query_as(&format!("{} WHERE slug = ?", SELECT_BUCKET))
                    .bind(id_or_slug)
                    .fetch_optional(&*self.db)
                    .await?
            }
        };

        let bucket = row.map(Bucket::from);
        if let Some(bucket) = &bucket {
            ctx.remember_bucket(bucket);
        }
        Ok(bucket)
    }

    /// Every bucket with its live object count.
    pub async fn list(&self) -> CdnResult<Vec<Bucket>> {
        let rows: Vec<BucketRow> = sqlx::query_as(
            "SELECT b.id, b.slug, b.label, b.allowed_extensions, b.max_size_bytes,
                    (SELECT COUNT(*) FROM objects o WHERE o.bucket_id = b.id) AS object_count,
                    b.created, b.created_by, b.modified, b.modified_by
             FROM buckets b ORDER BY b.slug",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(Bucket::from).collect())
    }

    /// Create a bucket, or return the existing one untouched when the slug is taken.
    ///
    /// Storage is materialised through the default driver before the row is
    /// written, and torn down again if the row cannot be written.
    pub async fn create(&self, ctx: &RequestCache, new: &NewBucket) -> CdnResult<Bucket> {
        ensure_slug_valid(&new.slug)?;
        if let Some(existing) = self.get(ctx, &new.slug).await? {
            return Ok(existing);
        }

        let driver = self.drivers.default_driver();
        driver
            .bucket_create(&new.slug)
            .await
            .map_err(|err| CdnError::driver("create bucket", new.slug.clone(), err))?;

        let now = Utc::now();
        let allowed = new
            .allowed_extensions
            .iter()
            .map(|ext| mime_registry::sanitize_extension(ext))
            .filter(|ext| !ext.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        let inserted = sqlx::query(
            "INSERT INTO buckets (slug, label, allowed_extensions, max_size_bytes, created, created_by, modified, modified_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.slug)
        .bind(new.label.as_deref().unwrap_or(&new.slug))
        .bind(&allowed)
        .bind(new.max_size_bytes.max(0))
        .bind(now)
        .bind(new.created_by)
        .bind(now)
        .bind(new.created_by)
        .execute(&*self.db)
        .await;

        match inserted {
            Ok(_) => {}
            // Lost a creation race; the storage now belongs to the winner.
            Err(err) if is_unique_violation(&err) => {
                return self
                    .get(ctx, &new.slug)
                    .await?
                    .ok_or_else(|| CdnError::NotFound(format!("bucket `{}`", new.slug)));
            }
            Err(err) => {
                if let Err(rollback) = driver.bucket_destroy(&new.slug).await {
                    warn!(bucket = %new.slug, "failed to roll back bucket storage: {}", rollback);
                }
                return Err(err.into());
            }
        }

        info!(bucket = %new.slug, "bucket created");
        self.get(ctx, &new.slug)
            .await?
            .ok_or_else(|| CdnError::NotFound(format!("bucket `{}`", new.slug)))
    }

    /// Purge every object in the bucket, then remove the bucket itself.
    ///
    /// Fails with `BucketNotEmpty` if any contained object could not be purged.
    pub async fn destroy(
        &self,
        ctx: &RequestCache,
        id_or_slug: &str,
        user: Option<i64>,
    ) -> CdnResult<()> {
        let bucket = self
            .get(ctx, id_or_slug)
            .await?
            .ok_or_else(|| CdnError::NotFound(format!("bucket `{}`", id_or_slug)))?;

        let mut failures = 0;
        for id in self.objects.live_ids(bucket.id).await? {
            if let Err(err) = self.trash.delete(ctx, id, user).await {
                warn!(bucket = %bucket.slug, id, "could not trash object: {}", err);
                failures += 1;
            }
        }
        let trashed = self.objects.trashed_ids(Some(bucket.id)).await?;
        let report = self.trash.purge(ctx, Some(&trashed)).await?;
        failures += report.failed.len();
        if failures > 0 {
            return Err(CdnError::BucketNotEmpty {
                slug: bucket.slug,
                failures,
            });
        }

        self.drivers
            .default_driver()
            .bucket_destroy(&bucket.slug)
            .await
            .map_err(|err| CdnError::driver("destroy bucket", bucket.slug.clone(), err))?;

        sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        ctx.forget_bucket(bucket.id);

        debug!(bucket = %bucket.slug, purged = report.purged.len(), "bucket destroyed");
        Ok(())
    }

    /// An empty allow-list permits every extension.
    pub fn is_extension_allowed(ext: &str, bucket: &Bucket) -> bool {
        if bucket.is_unrestricted() {
            return true;
        }
        let ext = mime_registry::sanitize_extension(ext);
        bucket
            .allowed_extensions
            .iter()
            .any(|allowed| mime_registry::sanitize_extension(allowed) == ext)
    }
}

/// Slugs appear in URLs, directory names and as the first segment of
/// rendition cache keys, so `-` is excluded.
pub fn ensure_slug_valid(slug: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidSlug {
        slug: slug.to_string(),
        reason: reason.to_string(),
    };

    if slug.len() < SLUG_MIN_LEN || slug.len() > SLUG_MAX_LEN {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !slug
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits and underscores",
        ));
    }
    if slug.starts_with('_') || slug.ends_with('_') {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    // All-digit strings address buckets by id.
    if !slug.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(invalid("must contain at least one letter"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, jpeg_bytes};

    #[test]
    fn slug_rules() {
        assert!(ensure_slug_valid("photos").is_ok());
        assert!(ensure_slug_valid("user_avatars_2").is_ok());
        assert!(ensure_slug_valid("ab").is_err());
        assert!(ensure_slug_valid("Photos").is_err());
        assert!(ensure_slug_valid("my-photos").is_err());
        assert!(ensure_slug_valid("_photos").is_err());
        assert!(ensure_slug_valid(&"a".repeat(64)).is_err());
        assert!(ensure_slug_valid("2024").is_err());
        assert!(ensure_slug_valid("1_2").is_err());
        assert!(ensure_slug_valid("y2024").is_ok());
    }

    #[tokio::test]
    async fn numeric_slug_is_rejected_before_storage() {
        let h = Harness::new().await;
        let err = h
            .buckets
            .create(&RequestCache::new(), &NewBucket::unrestricted("2024"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CdnError::Validation(ValidationError::InvalidSlug { .. })
        ));
        assert_eq!(h.driver.bucket_creates(), 0);
        assert!(h.buckets.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn numeric_reference_resolves_by_id() {
        let h = Harness::new().await;
        let bucket = h.seed_bucket("photos").await;
        let by_id = h
            .buckets
            .get(&RequestCache::new(), &bucket.id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id.slug, "photos");
    }

    #[tokio::test]
    async fn create_is_idempotent_and_keeps_policy() {
        let h = Harness::new().await;
        let ctx = RequestCache::new();
        let first = h
            .buckets
            .create(
                &ctx,
                &NewBucket {
                    slug: "avatars".into(),
                    allowed_extensions: vec!["JPEG".into(), "png".into()],
                    ..NewBucket::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first.allowed_extensions, vec!["jpg", "png"]);
        assert_eq!(first.label, "avatars");

        let second = h
            .buckets
            .create(&RequestCache::new(), &NewBucket::unrestricted("avatars"))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.allowed_extensions, vec!["jpg", "png"]);
        assert_eq!(h.driver.bucket_creates(), 1);
    }

    #[tokio::test]
    async fn create_writes_no_row_when_storage_fails() {
        let h = Harness::new().await;
        h.driver.fail_bucket_create(true);
        let err = h
            .buckets
            .create(&RequestCache::new(), &NewBucket::unrestricted("broken"))
            .await
            .unwrap_err();
        assert!(matches!(err, CdnError::Driver { .. }));
        assert!(h.buckets.get(&RequestCache::new(), "broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn destroy_purges_contents() {
        let h = Harness::new().await;
        h.seed_object("photos", "a.jpg", &jpeg_bytes(10, 10)).await;
        let trashed = h.seed_object("photos", "b.jpg", &jpeg_bytes(11, 11)).await;
        h.trash.delete(&RequestCache::new(), trashed.id, None).await.unwrap();

        h.buckets.destroy(&RequestCache::new(), "photos", None).await.unwrap();
        assert!(h.buckets.get(&RequestCache::new(), "photos").await.unwrap().is_none());
        assert!(!h.driver.has_bytes("photos", "a.jpg").await);
        assert!(!h.driver.has_bytes("photos", "b.jpg").await);
    }

    #[tokio::test]
    async fn destroy_refuses_when_a_purge_fails() {
        let h = Harness::new().await;
        h.seed_object("photos", "a.jpg", &jpeg_bytes(10, 10)).await;
        h.seed_object("photos", "b.jpg", &jpeg_bytes(11, 11)).await;
        h.driver.fail_destroy("b.jpg");

        let err = h
            .buckets
            .destroy(&RequestCache::new(), "photos", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CdnError::BucketNotEmpty { failures: 1, .. }));
        assert!(h.buckets.get(&RequestCache::new(), "photos").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_includes_object_counts() {
        let h = Harness::new().await;
        h.seed_object("photos", "a.jpg", &jpeg_bytes(10, 10)).await;
        h.seed_object("photos", "b.jpg", &jpeg_bytes(11, 11)).await;
        h.seed_bucket("docs").await;

        let buckets = h.buckets.list().await.unwrap();
        let counts = buckets
            .iter()
            .map(|b| (b.slug.as_str(), b.object_count))
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![("docs", Some(0)), ("photos", Some(2))]);
    }

    #[test]
    fn extension_policy() {
        let mut bucket = Bucket {
            id: 1,
            slug: "avatars".into(),
            label: "Avatars".into(),
            allowed_extensions: vec![],
            max_size_bytes: 0,
            object_count: None,
            created_at: Utc::now(),
            created_by: None,
            modified_at: Utc::now(),
            modified_by: None,
        };
        assert!(BucketStore::is_extension_allowed("gif", &bucket));
        bucket.allowed_extensions = vec!["jpg".into(), "png".into()];
        assert!(BucketStore::is_extension_allowed("JPEG", &bucket));
        assert!(!BucketStore::is_extension_allowed("gif", &bucket));
    }
}

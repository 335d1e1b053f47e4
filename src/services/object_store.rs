//! ObjectStore: queries and state changes over the `objects` (live) and
//! `objects_trash` tables.
//!
//! Live and trashed rows share one column set; moving between the tables is a
//! copy-then-delete inside a single transaction, so a row is always in exactly
//! one of them. Lookups go through the caller's `RequestCache`.

use chrono::Utc;
use futures::{StreamExt, stream::BoxStream};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use super::{
    is_unique_violation,
    request_cache::{Location, RequestCache},
};
use crate::{
    errors::{CdnError, CdnResult},
    models::object::{CounterKind, NewObject, Object, ObjectRow},
};

/// Columns copied verbatim when a row moves between tables.
const MOVE_COLUMNS: &str = "id, bucket_id, filename, display_filename, mime, size_bytes, \
     content_hash, driver, is_image, img_width, img_height, img_orientation, is_animated, \
     count_serve, count_download, count_thumb, count_scale, created, created_by, modified, \
     modified_by";

fn select_sql(location: Location) -> String {
    let (table, trash_columns) = match location {
        Location::Live => ("objects", "NULL AS trashed, NULL AS trashed_by"),
        Location::Trash => ("objects_trash", "o.trashed, o.trashed_by"),
    };
    format!(
        "SELECT o.id, o.bucket_id, b.slug AS bucket_slug, b.label AS bucket_label, \
         o.filename, o.display_filename, o.mime, o.size_bytes, o.content_hash, o.driver, \
         o.is_image, o.img_width, o.img_height, o.img_orientation, o.is_animated, \
         o.count_serve, o.count_download, o.count_thumb, o.count_scale, \
         o.created, o.created_by, o.modified, o.modified_by, {} \
         FROM {} o JOIN buckets b ON b.id = o.bucket_id",
        trash_columns, table
    )
}

static LIVE_STREAM_SQL: LazyLock<String> =
    LazyLock::new(|| format!("{} ORDER BY o.id", select_sql(Location::Live)));

/// Columns a listing may be narrowed by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterColumn {
    Mime,
    Driver,
    ContentHash,
    IsImage,
    IsAnimated,
    Orientation,
    CreatedBy,
}

impl FilterColumn {
    fn sql(&self) -> &'static str {
        match self {
            FilterColumn::Mime => "o.mime",
            FilterColumn::Driver => "o.driver",
            FilterColumn::ContentHash => "o.content_hash",
            FilterColumn::IsImage => "o.is_image",
            FilterColumn::IsAnimated => "o.is_animated",
            FilterColumn::Orientation => "o.img_orientation",
            FilterColumn::CreatedBy => "o.created_by",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

#[derive(Clone, Debug, Default)]
pub struct ObjectFilter {
    /// Substring match on the display filename.
    pub keyword: Option<String>,
    /// Bucket id or slug.
    pub bucket: Option<String>,
    /// Exact-match column predicates, ANDed together.
    pub predicates: Vec<(FilterColumn, FilterValue)>,
}

/// 1-indexed page of `page_size` rows.
#[derive(Clone, Copy, Debug)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub fn offset(&self) -> i64 {
        (i64::from(self.page) - 1).max(0) * i64::from(self.page_size)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
        }
    }
}

#[derive(Clone)]
pub struct ObjectStore {
    db: Arc<SqlitePool>,
}

impl ObjectStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Look up a live object. Numeric input is an id; anything else is a disk
    /// filename, optionally scoped to a bucket id or slug. A miss is `Ok(None)`.
    pub async fn get(
        &self,
        ctx: &RequestCache,
        id_or_filename: &str,
        bucket: Option<&str>,
    ) -> CdnResult<Option<Object>> {
        self.lookup(ctx, Location::Live, id_or_filename, bucket)
            .await
    }

    pub async fn get_from_trash(
        &self,
        ctx: &RequestCache,
        id_or_filename: &str,
        bucket: Option<&str>,
    ) -> CdnResult<Option<Object>> {
        self.lookup(ctx, Location::Trash, id_or_filename, bucket)
            .await
    }

    async fn lookup(
        &self,
        ctx: &RequestCache,
        location: Location,
        id_or_filename: &str,
        bucket: Option<&str>,
    ) -> CdnResult<Option<Object>> {
        let key = RequestCache::object_key(location, id_or_filename, bucket);
        if let Some(hit) = ctx.object(&key) {
            return Ok(Some(hit));
        }

        let mut builder = QueryBuilder::<Sqlite>::new(select_sql(location));
        match id_or_filename.parse::<i64>() {
            Ok(id) => {
                builder.push(" WHERE o.id = ");
                builder.push_bind(id);
            }
            Err(_) => {
                builder.push(" WHERE o.filename = ");
                builder.push_bind(id_or_filename.to_string());
            }
        }
        if let Some(bucket) = bucket {
            push_bucket_scope(&mut builder, bucket);
        }
        builder.push(" LIMIT 1");

        let row: Option<ObjectRow> = builder.build_query_as().fetch_optional(&*self.db).await?;
        let object = row.map(Object::from);
        if let Some(object) = &object {
            ctx.remember_object(key, object);
        }
        Ok(object)
    }

    /// Live object in `bucket_id` whose bytes hash to `hash`.
    pub async fn get_by_content_hash(
        &self,
        hash: &str,
        bucket_id: i64,
    ) -> CdnResult<Option<Object>> {
        let sql = format!(
            "{} WHERE o.content_hash = ? AND o.bucket_id = ? LIMIT 1",
            select_sql(Location::Live)
        );
        let row: Option<ObjectRow> = sqlx::query_as(&sql)
            .bind(hash)
            .bind(bucket_id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row.map(Object::from))
    }

    pub async fn list(
        &self,
        location: Location,
        filter: &ObjectFilter,
        page: Pagination,
    ) -> CdnResult<Vec<Object>> {
        let mut builder = QueryBuilder::<Sqlite>::new(select_sql(location));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY o.id DESC LIMIT ");
        builder.push_bind(i64::from(page.page_size.max(1)));
        builder.push(" OFFSET ");
        builder.push_bind(page.offset());

        let rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows.into_iter().map(Object::from).collect())
    }

    pub async fn count(&self, location: Location, filter: &ObjectFilter) -> CdnResult<i64> {
        let table = match location {
            Location::Live => "objects",
            Location::Trash => "objects_trash",
        };
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT COUNT(*) FROM {} o JOIN buckets b ON b.id = o.bucket_id",
            table
        ));
        push_filter(&mut builder, filter);
        let count: i64 = builder.build_query_scalar().fetch_one(&*self.db).await?;
        Ok(count)
    }

    /// Every live row, read through a cursor rather than buffered.
    pub fn stream_live(&self) -> BoxStream<'_, CdnResult<Object>> {
        sqlx::query_as::<_, ObjectRow>(LIVE_STREAM_SQL.as_str())
            .fetch(&*self.db)
            .map(|row| row.map(Object::from).map_err(CdnError::from))
            .boxed()
    }

    /// Atomically bump a usage counter. Best-effort: failures are logged only.
    pub async fn increment_counter(
        &self,
        kind: CounterKind,
        id_or_filename: &str,
        bucket: Option<&str>,
    ) {
        let column = kind.column();
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE objects SET {col} = {col} + 1",
            col = column
        ));
        match id_or_filename.parse::<i64>() {
            Ok(id) => {
                builder.push(" WHERE id = ");
                builder.push_bind(id);
            }
            Err(_) => {
                builder.push(" WHERE filename = ");
                builder.push_bind(id_or_filename.to_string());
            }
        }
        if let Some(bucket) = bucket {
            match bucket.parse::<i64>() {
                Ok(bucket_id) => {
                    builder.push(" AND bucket_id = ");
                    builder.push_bind(bucket_id);
                }
                Err(_) => {
                    builder.push(" AND bucket_id = (SELECT id FROM buckets WHERE slug = ");
                    builder.push_bind(bucket.to_string());
                    builder.push(")");
                }
            }
        }

        if let Err(err) = builder.build().execute(&*self.db).await {
            warn!(
                counter = column,
                object = id_or_filename,
                bucket = bucket.unwrap_or("*"),
                "failed to increment counter: {}",
                err
            );
        }
    }

    pub async fn create(&self, attrs: &NewObject) -> CdnResult<i64> {
        let now = Utc::now();
        let image = attrs.image.as_ref();
        let result = sqlx::query(
            "INSERT INTO objects (
                bucket_id, filename, display_filename, mime, size_bytes, content_hash, driver,
                is_image, img_width, img_height, img_orientation, is_animated,
                created, created_by, modified, modified_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attrs.bucket_id)
        .bind(&attrs.filename)
        .bind(&attrs.display_filename)
        .bind(&attrs.mime)
        .bind(attrs.size_bytes)
        .bind(&attrs.content_hash)
        .bind(&attrs.driver)
        .bind(image.is_some())
        .bind(image.map(|img| i64::from(img.width)))
        .bind(image.map(|img| i64::from(img.height)))
        .bind(image.map(|img| img.orientation.as_str()))
        .bind(image.map(|img| img.is_animated).unwrap_or(false))
        .bind(now)
        .bind(attrs.created_by)
        .bind(now)
        .bind(attrs.created_by)
        .execute(&*self.db)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, bucket_id = attrs.bucket_id, filename = %attrs.filename, "created object row");
        Ok(id)
    }

    /// Stamp the modified time, used when an upload resolves to an existing object.
    pub async fn touch(&self, ctx: &RequestCache, id: i64, user: Option<i64>) -> CdnResult<()> {
        sqlx::query("UPDATE objects SET modified = ?, modified_by = COALESCE(?, modified_by) WHERE id = ?")
            .bind(Utc::now())
            .bind(user)
            .bind(id)
            .execute(&*self.db)
            .await?;
        ctx.forget_object(id);
        Ok(())
    }

    /// Move a live row into the trash table.
    pub async fn move_to_trash(&self, id: i64, user: Option<i64>) -> CdnResult<()> {
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO objects_trash ({cols}, trashed, trashed_by)
             SELECT {cols}, ?, ? FROM objects WHERE id = ?",
            cols = MOVE_COLUMNS
        ))
        .bind(Utc::now())
        .bind(user)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(CdnError::NotFound(format!("object #{}", id)));
        }

        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(id, "moved object to trash");
        Ok(())
    }

    /// Move a trashed row back to the live table.
    pub async fn restore_from_trash(&self, id: i64, user: Option<i64>) -> CdnResult<()> {
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO objects ({cols}) SELECT {cols} FROM objects_trash WHERE id = ?",
            cols = MOVE_COLUMNS
        ))
        .bind(id)
        .execute(&mut *tx)
        .await;
        let inserted = match inserted {
            Ok(done) => done,
            Err(err) if is_unique_violation(&err) => {
                return Err(CdnError::Conflict(format!(
                    "object #{} cannot be restored: an identical object already exists in its bucket",
                    id
                )));
            }
            Err(err) => return Err(err.into()),
        };
        if inserted.rows_affected() == 0 {
            return Err(CdnError::NotFound(format!("trashed object #{}", id)));
        }

        sqlx::query("UPDATE objects SET modified = ?, modified_by = COALESCE(?, modified_by) WHERE id = ?")
            .bind(Utc::now())
            .bind(user)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM objects_trash WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(id, "restored object from trash");
        Ok(())
    }

    /// Permanently delete a trashed row. The live table is cleared too in case
    /// a stray copy exists.
    pub async fn purge(&self, id: i64) -> CdnResult<()> {
        let mut tx = self.db.begin().await?;

        let removed = sqlx::query("DELETE FROM objects_trash WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            return Err(CdnError::NotFound(format!("trashed object #{}", id)));
        }
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(id, "purged object rows");
        Ok(())
    }

    /// Ids of every trashed object, optionally within one bucket.
    pub async fn trashed_ids(&self, bucket_id: Option<i64>) -> CdnResult<Vec<i64>> {
        let ids = match bucket_id {
            Some(bucket_id) => {
                sqlx::query_scalar("SELECT id FROM objects_trash WHERE bucket_id = ? ORDER BY id")
                    .bind(bucket_id)
                    .fetch_all(&*self.db)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT id FROM objects_trash ORDER BY id")
                    .fetch_all(&*self.db)
                    .await?
            }
        };
        Ok(ids)
    }

    pub async fn live_ids(&self, bucket_id: i64) -> CdnResult<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT id FROM objects WHERE bucket_id = ? ORDER BY id")
            .bind(bucket_id)
            .fetch_all(&*self.db)
            .await?;
        Ok(ids)
    }
}

fn push_bucket_scope(builder: &mut QueryBuilder<'_, Sqlite>, bucket: &str) {
    match bucket.parse::<i64>() {
        Ok(bucket_id) => {
            builder.push(" AND o.bucket_id = ");
            builder.push_bind(bucket_id);
        }
        Err(_) => {
            builder.push(" AND b.slug = ");
            builder.push_bind(bucket.to_string());
        }
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ObjectFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(bucket) = &filter.bucket {
        push_bucket_scope(builder, bucket);
    }
    if let Some(keyword) = filter.keyword.as_deref().filter(|k| !k.trim().is_empty()) {
        builder.push(" AND o.display_filename LIKE ");
        builder.push_bind(format!("%{}%", keyword.trim()));
    }
    for (column, value) in &filter.predicates {
        builder.push(format!(" AND {} = ", column.sql()));
        match value {
            FilterValue::Text(text) => builder.push_bind(text.clone()),
            FilterValue::Int(int) => builder.push_bind(*int),
            FilterValue::Bool(flag) => builder.push_bind(*flag),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Harness, jpeg_bytes, png_bytes};

    fn names(objects: &[Object]) -> Vec<&str> {
        objects.iter().map(|o| o.filename.as_str()).collect()
    }

    fn page(page: u32, page_size: u32) -> Pagination {
        Pagination { page, page_size }
    }

    #[test]
    fn page_zero_clamps_to_the_first_page() {
        assert_eq!(page(0, 10).offset(), 0);
        assert_eq!(page(1, 10).offset(), 0);
        assert_eq!(page(3, 25).offset(), 50);
    }

    #[tokio::test]
    async fn listings_are_paged_newest_first() {
        let h = Harness::new().await;
        for name in ["a.txt", "b.txt", "c.txt"] {
            h.seed_object("docs", name, name.as_bytes()).await;
        }
        let all = ObjectFilter::default();

        let first = h.objects.list(Location::Live, &all, page(1, 2)).await.unwrap();
        assert_eq!(names(&first), ["c.txt", "b.txt"]);
        let second = h.objects.list(Location::Live, &all, page(2, 2)).await.unwrap();
        assert_eq!(names(&second), ["a.txt"]);
        let clamped = h.objects.list(Location::Live, &all, page(0, 2)).await.unwrap();
        assert_eq!(names(&clamped), names(&first));
        assert!(h.objects.list(Location::Live, &all, page(3, 2)).await.unwrap().is_empty());

        assert_eq!(h.objects.count(Location::Live, &all).await.unwrap(), 3);
        assert_eq!(h.objects.count(Location::Trash, &all).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn keyword_and_bucket_scope_narrow_listings() {
        let h = Harness::new().await;
        h.seed_object("docs", "report.txt", b"q3").await;
        h.seed_object("docs", "notes.txt", b"todo").await;
        let photo = h.seed_object("photos", "report.jpg", &jpeg_bytes(30, 20)).await;

        let count = |filter: ObjectFilter| {
            let objects = h.objects.clone();
            async move { objects.count(Location::Live, &filter).await.unwrap() }
        };

        let keyword = |k: &str| ObjectFilter {
            keyword: Some(k.to_string()),
            ..ObjectFilter::default()
        };
        assert_eq!(count(keyword("report")).await, 2);
        assert_eq!(count(keyword("REPORT")).await, 2);
        assert_eq!(count(keyword("   ")).await, 3);

        let scoped = ObjectFilter {
            bucket: Some("docs".into()),
            ..keyword("report")
        };
        let listed = h.objects.list(Location::Live, &scoped, Pagination::default()).await.unwrap();
        assert_eq!(names(&listed), ["report.txt"]);
        assert_eq!(listed[0].bucket.slug, "docs");

        let by_id = ObjectFilter {
            bucket: Some(photo.bucket.id.to_string()),
            ..ObjectFilter::default()
        };
        let listed = h.objects.list(Location::Live, &by_id, Pagination::default()).await.unwrap();
        assert_eq!(names(&listed), ["report.jpg"]);

        let unknown = ObjectFilter {
            bucket: Some("nowhere".into()),
            ..ObjectFilter::default()
        };
        assert_eq!(count(unknown).await, 0);
    }

    #[tokio::test]
    async fn predicates_match_columns_exactly() {
        let h = Harness::new().await;
        h.seed_object("docs", "readme.txt", b"hello").await;
        h.seed_object("media", "wide.jpg", &jpeg_bytes(300, 200)).await;
        h.seed_object("media", "tall.png", &png_bytes(20, 60)).await;

        let matching = |predicates: Vec<(FilterColumn, FilterValue)>| {
            let objects = h.objects.clone();
            async move {
                let filter = ObjectFilter {
                    predicates,
                    ..ObjectFilter::default()
                };
                let listed = objects
                    .list(Location::Live, &filter, Pagination::default())
                    .await
                    .unwrap();
                assert_eq!(
                    objects.count(Location::Live, &filter).await.unwrap(),
                    listed.len() as i64
                );
                listed.into_iter().map(|o| o.filename).collect::<Vec<_>>()
            }
        };

        assert_eq!(
            matching(vec![(FilterColumn::Mime, FilterValue::Text("text/plain".into()))]).await,
            ["readme.txt"]
        );
        assert_eq!(
            matching(vec![(FilterColumn::IsImage, FilterValue::Bool(true))]).await,
            ["tall.png", "wide.jpg"]
        );
        assert_eq!(
            matching(vec![
                (FilterColumn::IsImage, FilterValue::Bool(true)),
                (FilterColumn::Orientation, FilterValue::Text("PORTRAIT".into())),
            ])
            .await,
            ["tall.png"]
        );
        assert_eq!(
            matching(vec![(FilterColumn::Driver, FilterValue::Text("local".into()))])
                .await
                .len(),
            3
        );
        assert!(
            matching(vec![(FilterColumn::CreatedBy, FilterValue::Int(7))])
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn same_filename_in_two_buckets_stays_apart() {
        let h = Harness::new().await;
        let photos = h.seed_object("photos", "logo.png", &png_bytes(10, 10)).await;
        let brand = h.seed_object("brand", "logo.png", &png_bytes(12, 12)).await;
        assert_ne!(photos.id, brand.id);

        let ctx = RequestCache::new();
        for _ in 0..2 {
            let a = h.objects.get(&ctx, "logo.png", Some("photos")).await.unwrap().unwrap();
            let b = h.objects.get(&ctx, "logo.png", Some("brand")).await.unwrap().unwrap();
            assert_eq!((a.id, a.bucket.slug.as_str()), (photos.id, "photos"));
            assert_eq!((b.id, b.bucket.slug.as_str()), (brand.id, "brand"));
        }

        let scoped_by_id = h
            .objects
            .get(&ctx, "logo.png", Some(&brand.bucket.id.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scoped_by_id.id, brand.id);
        assert!(h.objects.get(&ctx, "logo.png", Some("docs")).await.unwrap().is_none());
    }
}

//! Administrative JSON API: object browsing, the trash lifecycle, bucket
//! management, orphan scans and signed URLs. Mounted behind `require_admin`.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{AppError, CdnError},
    models::{
        bucket::{Bucket, NewBucket},
        object::Object,
    },
    services::{
        object_store::{FilterColumn, FilterValue, ObjectFilter, Pagination},
        orphans::OrphanReport,
        request_cache::{Location, RequestCache},
        trash::PurgeReport,
    },
    state::AppState,
};

const MAX_PER_PAGE: u32 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct ListObjectsQuery {
    pub bucket: Option<String>,
    pub keyword: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    #[serde(default)]
    pub trashed: bool,
    pub mime: Option<String>,
    pub driver: Option<String>,
    pub content_hash: Option<String>,
    pub image: Option<bool>,
    pub animated: Option<bool>,
    pub orientation: Option<String>,
    pub created_by: Option<i64>,
}

impl ListObjectsQuery {
    fn predicates(&self) -> Vec<(FilterColumn, FilterValue)> {
        let text = |column, value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (column, FilterValue::Text(v.to_string())))
        };
        [
            text(FilterColumn::Mime, &self.mime),
            text(FilterColumn::Driver, &self.driver),
            text(FilterColumn::ContentHash, &self.content_hash),
            text(FilterColumn::Orientation, &self.orientation),
            self.image.map(|v| (FilterColumn::IsImage, FilterValue::Bool(v))),
            self.animated.map(|v| (FilterColumn::IsAnimated, FilterValue::Bool(v))),
            self.created_by.map(|v| (FilterColumn::CreatedBy, FilterValue::Int(v))),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct ObjectPage {
    pub objects: Vec<Object>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetObjectQuery {
    #[serde(default)]
    pub trashed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PurgeReq {
    pub ids: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: PurgeReport,
}

/// Body of `PUT /buckets/{slug}`; every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct BucketReq {
    pub label: Option<String>,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub max_size_bytes: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExpiringUrlReq {
    pub bucket: String,
    pub filename: String,
    pub expires_in: u64,
}

#[derive(Debug, Serialize)]
pub struct ExpiringUrlResponse {
    pub token: String,
    pub url: String,
    pub expires_at: i64,
}

/// `GET /objects`
pub async fn list_objects(
    State(state): State<AppState>,
    Query(q): Query<ListObjectsQuery>,
) -> Result<Json<ObjectPage>, AppError> {
    let location = if q.trashed {
        Location::Trash
    } else {
        Location::Live
    };
    let filter = ObjectFilter {
        predicates: q.predicates(),
        keyword: q.keyword.filter(|k| !k.trim().is_empty()),
        bucket: q.bucket.filter(|b| !b.trim().is_empty()),
    };
    let defaults = Pagination::default();
    let page = Pagination {
        page: q.page.unwrap_or(defaults.page).max(1),
        page_size: q.per_page.unwrap_or(defaults.page_size).clamp(1, MAX_PER_PAGE),
    };

    let objects = state.objects.list(location, &filter, page).await?;
    let total = state.objects.count(location, &filter).await?;
    Ok(Json(ObjectPage {
        objects,
        total,
        page: page.page,
        per_page: page.page_size,
    }))
}

/// `GET /objects/{id}`
pub async fn get_object(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<GetObjectQuery>,
) -> Result<Json<Object>, AppError> {
    let ctx = RequestCache::new();
    let key = id.to_string();
    let object = match state.objects.get(&ctx, &key, None).await? {
        Some(object) => Some(object),
        None if q.trashed => state.objects.get_from_trash(&ctx, &key, None).await?,
        None => None,
    };
    object
        .map(Json)
        .ok_or_else(|| CdnError::NotFound(format!("object #{}", id)).into())
}

/// `DELETE /objects/{id}`: move to the trash.
pub async fn delete_object(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.trash.delete(&RequestCache::new(), id, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /objects/{id}/destroy`: trash and purge in one step.
pub async fn destroy_object(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.trash.destroy(&RequestCache::new(), id, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /trash/{id}/restore`
pub async fn restore_object(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Object>, AppError> {
    let ctx = RequestCache::new();
    state.trash.restore(&ctx, id, None).await?;
    let object = state
        .objects
        .get(&ctx, &id.to_string(), None)
        .await?
        .ok_or_else(|| CdnError::NotFound(format!("object #{}", id)))?;
    Ok(Json(object))
}

/// `POST /trash/purge`: `{ids}` purges those, no body empties the trash.
pub async fn purge_trash(
    State(state): State<AppState>,
    body: Option<Json<PurgeReq>>,
) -> Result<Json<PurgeResponse>, AppError> {
    let ids = body.and_then(|Json(req)| req.ids);
    let report = state.trash.purge(&RequestCache::new(), ids.as_deref()).await?;
    Ok(Json(PurgeResponse {
        success: report.succeeded(),
        report,
    }))
}

/// `GET /buckets`
pub async fn list_buckets(State(state): State<AppState>) -> Result<Json<Vec<Bucket>>, AppError> {
    Ok(Json(state.buckets.list().await?))
}

/// `PUT /buckets/{slug}`: create, or return the bucket that already exists.
pub async fn put_bucket(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    body: Option<Json<BucketReq>>,
) -> Result<Json<Bucket>, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let new = NewBucket {
        slug,
        label: req.label,
        allowed_extensions: req.allowed_extensions,
        max_size_bytes: req.max_size_bytes,
        created_by: None,
    };
    Ok(Json(state.buckets.create(&RequestCache::new(), &new).await?))
}

/// `DELETE /buckets/{slug}`: purge the contents, then drop the bucket.
pub async fn delete_bucket(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .buckets
        .destroy(&RequestCache::new(), &slug, None)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /admin/orphans`
pub async fn find_orphans(State(state): State<AppState>) -> Result<Json<OrphanReport>, AppError> {
    Ok(Json(state.orphans.find().await?))
}

/// `POST /urls/expiring`: a serve URL valid for `expires_in` seconds.
pub async fn expiring_url(
    State(state): State<AppState>,
    Json(req): Json<ExpiringUrlReq>,
) -> Result<Json<ExpiringUrlResponse>, AppError> {
    if req.expires_in == 0 {
        return Err(AppError::bad_request("`expires_in` must be positive"));
    }
    let object = state
        .objects
        .get(&RequestCache::new(), &req.filename, Some(&req.bucket))
        .await?
        .ok_or_else(|| CdnError::NotFound(format!("{}/{}", req.bucket, req.filename)))?;

    let issued_at = chrono::Utc::now().timestamp();
    let token = state
        .signer
        .issue_at(&object.bucket.slug, &object.filename, req.expires_in, issued_at);
    let url = state
        .drivers
        .get(&object.driver)?
        .url_expiring(&object.bucket.slug, &object.filename, &token);

    Ok(Json(ExpiringUrlResponse {
        token,
        url,
        expires_at: issued_at.saturating_add(req.expires_in as i64),
    }))
}

//! Public CDN endpoints: raw serve, object renditions and generated images.
//!
//! Image endpoints never answer with a server error: anything that goes wrong
//! after validation becomes a "bad source" image sized to the request.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::str::FromStr;
use tracing::{error, warn};

use super::{
    auth::AdminAccess,
    conditional::{
        CacheStatus, FileServe, bad_source_image, bad_source_json, etag_matches, file_response,
        not_modified,
    },
};
use crate::{
    errors::{AppError, CdnError},
    models::{
        object::{CounterKind, Object},
        rendition::{AvatarSex, TransformKind},
    },
    services::{
        image_transformer,
        rendition::CacheKey,
        request_cache::RequestCache,
        transform_cache::{RenditionRequest, Resolution},
    },
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct ServeQuery {
    pub dl: Option<String>,
    pub trashed: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransformQuery {
    pub trashed: Option<String>,
}

fn flag(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "yes" | "on"))
}

/// `GET /serve/{bucket}/{filename}`: the stored bytes, inline or as a download.
///
/// With `?token=` the request must carry a valid signed token for exactly
/// this bucket and filename.
pub async fn serve(
    State(state): State<AppState>,
    Path((bucket, filename)): Path<(String, String)>,
    Query(query): Query<ServeQuery>,
    AdminAccess(admin): AdminAccess,
    headers: HeaderMap,
) -> Response {
    if let Some(token) = query.token.as_deref() {
        if let Err(reason) = state.signer.verify(token, &bucket, &filename) {
            return AppError::from(CdnError::Token(reason)).into_response();
        }
    }
    let download = flag(query.dl.as_deref());
    let allow_trash = admin && flag(query.trashed.as_deref());

    let ctx = RequestCache::new();
    let object = match find_object(&state, &ctx, &bucket, &filename, allow_trash).await {
        Ok(Some(object)) => object,
        Ok(None) => {
            return bad_source_json("File not found", &format!("{}/{} does not exist", bucket, filename));
        }
        Err(err) => {
            error!(bucket, filename, "object lookup failed: {}", err);
            return bad_source_json("File could not be served", &err.to_string());
        }
    };

    let max_age = state.config.max_age_secs;
    if etag_matches(&headers, &object.content_hash) {
        return not_modified(&object.content_hash, max_age);
    }

    let local = match state.drivers.get(&object.driver) {
        Ok(driver) => driver
            .object_local_path(&object.bucket.slug, &object.filename)
            .await
            .map_err(|err| err.to_string()),
        Err(err) => Err(err.to_string()),
    };
    let path = match local {
        Ok(Some(path)) => path,
        Ok(None) => {
            warn!(bucket, filename, "row exists but bytes are missing");
            return bad_source_json("File not found", &format!("{}/{} is missing from storage", bucket, filename));
        }
        Err(err) => {
            warn!(bucket, filename, "driver fetch failed: {}", err);
            return bad_source_json("File could not be served", &err);
        }
    };

    let counter = if download {
        CounterKind::Download
    } else {
        CounterKind::Serve
    };
    state
        .objects
        .increment_counter(counter, &object.id.to_string(), None)
        .await;

    let served = file_response(
        &path,
        FileServe {
            content_type: &object.mime,
            etag: &object.content_hash,
            max_age,
            cache_status: None,
            filename: &object.display_filename,
            download,
        },
    )
    .await;
    served.unwrap_or_else(|err| {
        error!(bucket, filename, "could not open stored file: {}", err);
        bad_source_json("File could not be served", &err.to_string())
    })
}

async fn find_object(
    state: &AppState,
    ctx: &RequestCache,
    bucket: &str,
    filename: &str,
    allow_trash: bool,
) -> Result<Option<Object>, CdnError> {
    if let Some(object) = state.objects.get(ctx, filename, Some(bucket)).await? {
        return Ok(Some(object));
    }
    if allow_trash {
        return state.objects.get_from_trash(ctx, filename, Some(bucket)).await;
    }
    Ok(None)
}

/// `GET /crop/{width}/{height}/{bucket}/{filename}`: fill the box, cropping overflow.
pub async fn crop(
    State(state): State<AppState>,
    Path((width, height, bucket, filename)): Path<(u32, u32, String, String)>,
    Query(query): Query<TransformQuery>,
    AdminAccess(admin): AdminAccess,
    headers: HeaderMap,
) -> Response {
    let allow_trash = admin && flag(query.trashed.as_deref());
    let request = RenditionRequest {
        bucket: &bucket,
        filename: &filename,
        kind: TransformKind::Crop,
        width,
        height,
        allow_trash,
    };
    rendition(&state, request, &headers).await
}

/// `GET /scale/{width}/{height}/{bucket}/{filename}`: fit inside the box.
pub async fn scale(
    State(state): State<AppState>,
    Path((width, height, bucket, filename)): Path<(u32, u32, String, String)>,
    Query(query): Query<TransformQuery>,
    AdminAccess(admin): AdminAccess,
    headers: HeaderMap,
) -> Response {
    let allow_trash = admin && flag(query.trashed.as_deref());
    let request = RenditionRequest {
        bucket: &bucket,
        filename: &filename,
        kind: TransformKind::Scale,
        width,
        height,
        allow_trash,
    };
    rendition(&state, request, &headers).await
}

/// `GET /thumb/{width}/{height}/{bucket}/{filename}`: crop semantics, own cache entries.
pub async fn thumb(
    State(state): State<AppState>,
    Path((width, height, bucket, filename)): Path<(u32, u32, String, String)>,
    Query(query): Query<TransformQuery>,
    AdminAccess(admin): AdminAccess,
    headers: HeaderMap,
) -> Response {
    let allow_trash = admin && flag(query.trashed.as_deref());
    let request = RenditionRequest {
        bucket: &bucket,
        filename: &filename,
        kind: TransformKind::Thumb,
        width,
        height,
        allow_trash,
    };
    rendition(&state, request, &headers).await
}

async fn rendition(state: &AppState, request: RenditionRequest<'_>, headers: &HeaderMap) -> Response {
    let ctx = RequestCache::new();
    let prepared = match state.transforms.prepare(&ctx, request).await {
        Ok(prepared) => prepared,
        Err(CdnError::Validation(err)) => {
            return bad_source_json("Invalid transform request", &err.to_string());
        }
        Err(err) => {
            error!(
                bucket = request.bucket,
                filename = request.filename,
                kind = request.kind.as_str(),
                "could not prepare rendition: {}",
                err
            );
            return bad_source_image(request.width, request.height, &err.to_string()).await;
        }
    };

    let max_age = state.config.max_age_secs;
    let etag = prepared.key.etag();
    if etag_matches(headers, &etag) {
        return not_modified(&etag, max_age);
    }

    match state.transforms.resolve(&ctx, &prepared).await {
        Ok(resolution) => respond(resolution, max_age).await,
        Err(err) => {
            error!(key = %prepared.key, "rendition failed: {}", err);
            bad_source_image(prepared.width, prepared.height, &err.to_string()).await
        }
    }
}

/// `GET /placeholder/{width}/{height}/{border}`
pub async fn placeholder(
    State(state): State<AppState>,
    Path((width, height, border)): Path<(u32, u32, u32)>,
    headers: HeaderMap,
) -> Response {
    let key = CacheKey::placeholder(width, height, border);
    generated(&state, key, width, height, &headers, move || {
        image_transformer::placeholder(width, height, border)
    })
    .await
}

/// `GET /blank_avatar/{width}/{height}/{sex}`
pub async fn blank_avatar(
    State(state): State<AppState>,
    Path((width, height, sex)): Path<(u32, u32, String)>,
    headers: HeaderMap,
) -> Response {
    let sex = match AvatarSex::from_str(&sex) {
        Ok(sex) => sex,
        Err(reason) => return bad_source_json("Invalid avatar request", &reason),
    };
    let key = CacheKey::blank_avatar(width, height, sex);
    generated(&state, key, width, height, &headers, move || {
        image_transformer::blank_avatar(width, height, sex)
    })
    .await
}

async fn generated<F>(
    state: &AppState,
    key: CacheKey,
    width: u32,
    height: u32,
    headers: &HeaderMap,
    render: F,
) -> Response
where
    F: FnOnce() -> Result<Vec<u8>, crate::errors::TransformError> + Send + 'static,
{
    let max_age = state.config.max_age_secs;
    let etag = key.etag();
    if etag_matches(headers, &etag) {
        return not_modified(&etag, max_age);
    }

    match state.transforms.resolve_generated(key, width, height, render).await {
        Ok(resolution) => respond(resolution, max_age).await,
        Err(CdnError::Validation(err)) => bad_source_json("Invalid image request", &err.to_string()),
        Err(err) => {
            error!(width, height, "generated image failed: {}", err);
            bad_source_image(width, height, &err.to_string()).await
        }
    }
}

async fn respond(resolution: Resolution, max_age: u64) -> Response {
    let (path, key, status) = match resolution {
        Resolution::Hit { path, key } => (path, key, CacheStatus::Hit),
        Resolution::Miss { path, key } => (path, key, CacheStatus::Miss),
        Resolution::BadSource {
            width,
            height,
            reason,
        } => return bad_source_image(width, height, &reason).await,
    };

    let etag = key.etag();
    let served = file_response(
        &path,
        FileServe {
            content_type: key.format().content_type(),
            etag: &etag,
            max_age,
            cache_status: Some(status),
            filename: key.file_name(),
            download: false,
        },
    )
    .await;
    match served {
        Ok(response) => response,
        Err(err) => {
            // Removed between resolution and open, e.g. by an invalidation.
            warn!(key = %key, "rendition vanished before it was served: {}", err);
            bad_source_json("The requested image could not be served", &err.to_string())
        }
    }
}

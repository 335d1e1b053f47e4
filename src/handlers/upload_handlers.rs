//! Upload endpoints. All three feed the same pipeline and answer with the
//! stored object; re-uploading identical bytes returns the existing one.

use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode, header},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;

use crate::{
    errors::{AppError, CdnError, ValidationError},
    models::object::Object,
    services::{
        request_cache::RequestCache,
        upload::{UploadOptions, UploadOutcome, UploadSource},
    },
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub object: Object,
    pub duplicate: bool,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoteUploadReq {
    pub url: String,
    pub filename: Option<String>,
}

/// `POST /upload/{bucket}`: multipart form with a `file` field.
///
/// Optional text fields: `filename`, `min_width`, `max_width`, `min_height`, `max_height`.
pub async fn upload_multipart(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut source = None;
    let mut opts = UploadOptions {
        bucket,
        ..UploadOptions::default()
    };

    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(upload_error)?;
                source = Some(UploadSource::Multipart {
                    file_name,
                    content_type,
                    data,
                });
            }
            "filename" => {
                let text = field.text().await.map_err(upload_error)?;
                opts.filename = Some(text).filter(|t| !t.trim().is_empty());
            }
            "min_width" => opts.min_width = parse_bound(&name, field.text().await.map_err(upload_error)?)?,
            "max_width" => opts.max_width = parse_bound(&name, field.text().await.map_err(upload_error)?)?,
            "min_height" => opts.min_height = parse_bound(&name, field.text().await.map_err(upload_error)?)?,
            "max_height" => opts.max_height = parse_bound(&name, field.text().await.map_err(upload_error)?)?,
            _ => tracing::debug!(field = %name, "ignoring unknown multipart field"),
        }
    }

    let source = source.ok_or_else(|| AppError::from(CdnError::from(ValidationError::NoFile)))?;
    run(&state, source, opts).await
}

/// `PUT /upload/{bucket}/{filename}`: the raw request body, typed by `Content-Type`.
pub async fn upload_stream(
    State(state): State<AppState>,
    Path((bucket, filename)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty());

    let data = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();

    let opts = UploadOptions {
        bucket,
        filename: Some(filename),
        ..UploadOptions::default()
    };
    run(&state, UploadSource::Stream { data, content_type }, opts).await
}

/// `POST /upload/{bucket}/remote`: fetch `url` and store it.
pub async fn upload_remote(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Json(req): Json<RemoteUploadReq>,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let opts = UploadOptions {
        bucket,
        filename: req.filename,
        ..UploadOptions::default()
    };
    run(&state, UploadSource::RemoteUrl(req.url), opts).await
}

async fn run(
    state: &AppState,
    source: UploadSource,
    opts: UploadOptions,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let UploadOutcome { object, duplicate } = state
        .uploads
        .upload(&RequestCache::new(), source, opts)
        .await?;

    let url = state
        .drivers
        .get(&object.driver)
        .map(|driver| driver.url_serve(&object.bucket.slug, &object.filename, false))?;
    let status = if duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(UploadResponse {
            object,
            duplicate,
            url,
        }),
    ))
}

fn upload_error(err: impl std::fmt::Display) -> AppError {
    CdnError::from(ValidationError::Upload(err.to_string())).into()
}

fn parse_bound(field: &str, raw: String) -> Result<Option<u32>, AppError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<u32>()
        .map(Some)
        .map_err(|_| AppError::bad_request(format!("`{}` must be a whole number of pixels", field)))
}

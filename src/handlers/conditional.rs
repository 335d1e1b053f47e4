//! Conditional serving: ETag revalidation, cache headers and the bad-source
//! responses image endpoints fall back to.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use std::{io, path::Path};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::{errors::AppError, services::image_transformer};

pub const X_CDN_CACHE: HeaderName = HeaderName::from_static("x-cdn-cache");

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const NO_CACHE: &str = "no-cache, must-revalidate";
const EXPIRED: &str = "Mon, 26 Jul 1997 05:00:00 GMT";
/// `Expires` is capped at ten years out.
const MAX_EXPIRES_SECS: u64 = 10 * 365 * 24 * 3600;

/// How a rendition reached the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Everything a full file response needs besides the file.
#[derive(Debug, Clone)]
pub struct FileServe<'a> {
    pub content_type: &'a str,
    /// Unquoted entity tag.
    pub etag: &'a str,
    pub max_age: u64,
    pub cache_status: Option<CacheStatus>,
    /// Name offered in `Content-Disposition`.
    pub filename: &'a str,
    /// Force a download: `attachment` disposition and an octet-stream body.
    pub download: bool,
}

/// True when `If-None-Match` names `etag` (or is `*`). Weak tags compare equal.
pub fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|candidate| {
            candidate == "*"
                || candidate.trim_start_matches("W/").trim_matches('"') == etag
        })
}

pub fn not_modified(etag: &str, max_age: u64) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    let headers = response.headers_mut();
    insert(headers, header::ETAG, &quote(etag));
    insert(
        headers,
        header::CACHE_CONTROL,
        &format!("max-age={}, must-revalidate", max_age),
    );
    response
}

/// Stream `path` with the full cache header set.
pub async fn file_response(path: &Path, serve: FileServe<'_>) -> io::Result<Response> {
    let file = File::open(path).await?;
    let metadata = file.metadata().await?;
    let modified: DateTime<Utc> = metadata.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
    let expires = Utc::now() + Duration::seconds(serve.max_age.min(MAX_EXPIRES_SECS) as i64);

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();

    let content_type = if serve.download {
        "application/octet-stream"
    } else {
        serve.content_type
    };
    insert(headers, header::CONTENT_TYPE, content_type);
    insert(headers, header::CONTENT_LENGTH, &metadata.len().to_string());
    insert(
        headers,
        header::CACHE_CONTROL,
        &format!("max-age={}, must-revalidate", serve.max_age),
    );
    insert(headers, header::LAST_MODIFIED, &modified.format(HTTP_DATE).to_string());
    insert(headers, header::EXPIRES, &expires.format(HTTP_DATE).to_string());
    insert(headers, header::ETAG, &quote(serve.etag));
    if let Some(status) = serve.cache_status {
        insert(headers, X_CDN_CACHE, status.as_str());
    }

    let disposition = if serve.download { "attachment" } else { "inline" };
    let with_name = format!(
        "{}; filename=\"{}\"",
        disposition,
        serve.filename.replace(['"', '\\'], "_")
    );
    match HeaderValue::from_str(&with_name) {
        Ok(value) => {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        Err(_) => insert(headers, header::CONTENT_DISPOSITION, disposition),
    }

    Ok(response)
}

/// A "broken image" PNG sized like the request, with status 400.
///
/// Falls back to the JSON form if even that image cannot be produced.
pub async fn bad_source_image(width: u32, height: u32, reason: &str) -> Response {
    warn!(width, height, "serving bad source: {}", reason);
    let rendered = tokio::task::spawn_blocking(move || image_transformer::bad_source(width, height)).await;
    match rendered {
        Ok(Ok(png)) => {
            let mut response = (StatusCode::BAD_REQUEST, png).into_response();
            let headers = response.headers_mut();
            insert(headers, header::CONTENT_TYPE, "image/png");
            no_cache(headers);
            response
        }
        _ => bad_source_json("The requested image could not be produced", reason),
    }
}

/// `400 {status, message, error}` with no-cache headers.
pub fn bad_source_json(message: &str, error: &str) -> Response {
    let mut response = AppError::bad_request(message).with_error(error).into_response();
    no_cache(response.headers_mut());
    response
}

fn no_cache(headers: &mut HeaderMap) {
    insert(headers, header::CACHE_CONTROL, NO_CACHE);
    insert(headers, header::EXPIRES, EXPIRED);
}

fn quote(etag: &str) -> String {
    format!("\"{}\"", etag)
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "dropping unrepresentable header value"),
    }
}

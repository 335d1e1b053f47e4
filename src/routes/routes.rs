//! Defines routes for the CDN, upload and admin surfaces.
//!
//! ## Structure
//! - **CDN endpoints** (public)
//!   - `GET /serve/{bucket}/{filename}` — stored bytes (`?dl=1`, `?token=`, `?trashed=1`)
//!   - `GET /crop|scale|thumb/{width}/{height}/{bucket}/{filename}` — renditions
//!   - `GET /placeholder/{width}/{height}/{border}`
//!   - `GET /blank_avatar/{width}/{height}/{sex}`
//!
//! - **Upload endpoints** (admin token)
//!   - `POST /upload/{bucket}` — multipart
//!   - `PUT  /upload/{bucket}/{filename}` — raw body
//!   - `POST /upload/{bucket}/remote` — fetch a URL
//!
//! - **Admin endpoints** (admin token)
//!   - `/objects`, `/trash`, `/buckets`, `/admin/orphans`, `/urls/expiring`

use crate::{
    handlers::{
        admin_handlers::{
            delete_bucket, delete_object, destroy_object, expiring_url, find_orphans, get_object,
            list_buckets, list_objects, purge_trash, put_bucket, restore_object,
        },
        auth::require_admin,
        cdn_handlers::{blank_avatar, crop, placeholder, scale, serve, thumb},
        health_handlers::{healthz, readyz},
        upload_handlers::{upload_multipart, upload_remote, upload_stream},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post, put},
};

/// Build the full router with `state` attached.
pub fn routes(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.max_upload_bytes)
        .ok()
        .filter(|limit| *limit > 0)
        .map(DefaultBodyLimit::max)
        .unwrap_or_else(DefaultBodyLimit::disable);

    let uploads = Router::new()
        .route("/upload/{bucket}", post(upload_multipart))
        .route("/upload/{bucket}/remote", post(upload_remote))
        .route("/upload/{bucket}/{filename}", put(upload_stream))
        .layer(body_limit);

    let admin = Router::new()
        .route("/objects", get(list_objects))
        .route("/objects/{id}", get(get_object).delete(delete_object))
        .route("/objects/{id}/destroy", delete(destroy_object))
        .route("/trash/{id}/restore", post(restore_object))
        .route("/trash/purge", post(purge_trash))
        .route("/buckets", get(list_buckets))
        .route("/buckets/{slug}", put(put_bucket).delete(delete_bucket))
        .route("/admin/orphans", get(find_orphans))
        .route("/urls/expiring", post(expiring_url))
        .merge(uploads)
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/serve/{bucket}/{filename}", get(serve))
        .route("/crop/{width}/{height}/{bucket}/{filename}", get(crop))
        .route("/scale/{width}/{height}/{bucket}/{filename}", get(scale))
        .route("/thumb/{width}/{height}/{bucket}/{filename}", get(thumb))
        .route("/placeholder/{width}/{height}/{border}", get(placeholder))
        .route("/blank_avatar/{width}/{height}/{sex}", get(blank_avatar))
        .merge(admin)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::conditional::X_CDN_CACHE,
        services::request_cache::RequestCache,
        test_support::{Harness, jpeg_bytes},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    const ADMIN: &str = "s3cret";

    async fn send(app: &Router, req: Request<Body>) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn admin_get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(res: Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn crop_is_rendered_once_then_served_from_cache() {
        let h = Harness::new().await;
        h.seed_object("photos", "sunset.jpg", &jpeg_bytes(300, 200)).await;
        let app = routes(h.state.clone());
        let etag = format!("\"{:x}\"", md5::compute("photos-sunset-CROP-100x100.jpg"));

        let first = send(&app, get("/crop/100/100/photos/sunset.jpg")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[X_CDN_CACHE], "MISS");
        assert_eq!(first.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(first.headers()[header::ETAG], etag.as_str());
        assert_eq!(
            first.headers()[header::CACHE_CONTROL],
            "max-age=3600, must-revalidate"
        );
        let body = to_bytes(first.into_body(), usize::MAX).await.unwrap();
        let rendered = image::load_from_memory(&body).unwrap();
        assert_eq!((rendered.width(), rendered.height()), (100, 100));

        let second = send(&app, get("/crop/100/100/photos/sunset.jpg")).await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()[X_CDN_CACHE], "HIT");
        assert_eq!(h.transforms.render_count(), 1);
    }

    #[tokio::test]
    async fn matching_etag_is_answered_without_touching_storage() {
        let h = Harness::new().await;
        h.seed_object("photos", "sunset.jpg", &jpeg_bytes(300, 200)).await;
        let app = routes(h.state.clone());
        let etag = format!("\"{:x}\"", md5::compute("photos-sunset-CROP-100x100.jpg"));
        let calls_before = h.driver.total_calls();

        let req = Request::builder()
            .uri("/crop/100/100/photos/sunset.jpg")
            .header(header::IF_NONE_MATCH, &etag)
            .body(Body::empty())
            .unwrap();
        let res = send(&app, req).await;
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(res.headers()[header::ETAG], etag.as_str());
        assert_eq!(h.driver.total_calls(), calls_before);
        assert_eq!(h.transforms.render_count(), 0);
    }

    #[tokio::test]
    async fn disallowed_size_is_a_json_bad_request() {
        let h = Harness::new().await;
        h.seed_object("photos", "sunset.jpg", &jpeg_bytes(300, 200)).await;
        let app = routes(h.state.clone());

        let res = send(&app, get("/crop/123/77/photos/sunset.jpg")).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(
            res.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("application/json")
        );
        assert_eq!(res.headers()[header::CACHE_CONTROL], "no-cache, must-revalidate");
    }

    #[tokio::test]
    async fn missing_source_is_a_bad_source_image() {
        let h = Harness::new().await;
        let app = routes(h.state.clone());

        let res = send(&app, get("/scale/100/100/photos/nowhere.jpg")).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let img = image::load_from_memory(&body).unwrap();
        assert_eq!((img.width(), img.height()), (100, 100));
    }

    #[tokio::test]
    async fn download_flag_forces_an_attachment() {
        let h = Harness::new().await;
        let object = h.seed_object("docs", "notes.txt", b"hello cdn").await;
        let app = routes(h.state.clone());

        let res = send(&app, get("/serve/docs/notes.txt?dl=1")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(
            res.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"notes.txt\""
        );
        let etag = format!("\"{}\"", object.content_hash);
        assert_eq!(res.headers()[header::ETAG], etag.as_str());
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello cdn");

        let inline = send(&app, get("/serve/docs/notes.txt")).await;
        assert_eq!(inline.headers()[header::CONTENT_TYPE], "text/plain");

        let counters = h
            .objects
            .get(&RequestCache::new(), &object.id.to_string(), None)
            .await
            .unwrap()
            .unwrap()
            .counters;
        assert_eq!((counters.downloads, counters.serves), (1, 1));
    }

    #[tokio::test]
    async fn admin_routes_need_the_bearer_token() {
        let h = Harness::with_admin_token(ADMIN).await;
        let app = routes(h.state.clone());

        let res = send(&app, get("/objects")).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = send(&app, admin_get("/objects")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["total"], 0);

        let res = send(&app, get("/healthz")).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn object_listing_accepts_column_filters() {
        let h = Harness::with_admin_token(ADMIN).await;
        h.seed_object("docs", "report.txt", b"quarterly").await;
        h.seed_object("docs", "cover.jpg", &jpeg_bytes(40, 20)).await;
        let app = routes(h.state.clone());

        let res = send(&app, admin_get("/objects?bucket=docs&mime=text/plain")).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["objects"][0]["filename"], "report.txt");

        let body = json_body(send(&app, admin_get("/objects?image=true&orientation=LANDSCAPE")).await).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["objects"][0]["filename"], "cover.jpg");

        let body = json_body(send(&app, admin_get("/objects?created_by=42")).await).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn expiring_url_serves_only_its_own_file() {
        let h = Harness::with_admin_token(ADMIN).await;
        h.seed_object("docs", "report.txt", b"quarterly").await;
        h.seed_object("docs", "other.txt", b"unrelated").await;
        let app = routes(h.state.clone());

        let req = Request::builder()
            .method("POST")
            .uri("/urls/expiring")
            .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"bucket":"docs","filename":"report.txt","expires_in":600}"#,
            ))
            .unwrap();
        let res = send(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        let url = body["url"].as_str().unwrap();
        let token = body["token"].as_str().unwrap();
        let path = url.strip_prefix("http://cdn.test").unwrap();

        let res = send(&app, get(path)).await;
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"quarterly");

        let res = send(&app, get(&format!("/serve/docs/other.txt?token={}", token))).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(res).await["message"], "invalid token");
    }

    #[tokio::test]
    async fn trashed_sources_render_only_for_admins() {
        let h = Harness::with_admin_token(ADMIN).await;
        let object = h.seed_object("photos", "gone.jpg", &jpeg_bytes(300, 200)).await;
        h.trash.delete(&RequestCache::new(), object.id, None).await.unwrap();
        let app = routes(h.state.clone());

        let res = send(&app, get("/crop/100/100/photos/gone.jpg?trashed=1")).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = send(&app, admin_get("/crop/100/100/photos/gone.jpg?trashed=1")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/jpeg");
    }

    #[tokio::test]
    async fn multipart_upload_reports_duplicates() {
        let h = Harness::new().await;
        let app = routes(h.state.clone());
        let bytes = jpeg_bytes(40, 30);

        let boundary = "cdn-test-boundary";
        let mut form = Vec::new();
        form.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"pic.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
                b = boundary
            )
            .as_bytes(),
        );
        form.extend_from_slice(&bytes);
        form.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let upload = |body: Vec<u8>| {
            Request::builder()
                .method("POST")
                .uri("/upload/photos")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(Body::from(body))
                .unwrap()
        };

        let res = send(&app, upload(form.clone())).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let first = json_body(res).await;
        assert_eq!(first["duplicate"], false);
        assert_eq!(first["object"]["image"]["width"], 40);

        let res = send(&app, upload(form)).await;
        assert_eq!(res.status(), StatusCode::OK);
        let second = json_body(res).await;
        assert_eq!(second["duplicate"], true);
        assert_eq!(second["object"]["id"], first["object"]["id"]);
        assert_eq!(h.object_count().await, 1);
    }

    #[tokio::test]
    async fn readiness_checks_pass_on_a_fresh_instance() {
        let h = Harness::new().await;
        let app = routes(h.state.clone());

        let res = send(&app, get("/readyz")).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["cache_dir"]["ok"], true);
    }
}

//! Domain services: metadata stores, the upload pipeline, the rendition cache
//! and the trash lifecycle. Handlers stay thin and call into these.

pub mod bucket_store;
pub mod image_transformer;
pub mod mime_registry;
pub mod object_store;
pub mod orphans;
pub mod rendition;
pub mod request_cache;
pub mod signed_url;
pub mod transform_cache;
pub mod trash;
pub mod upload;

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

//! Core data models for the object CDN.
//!
//! Buckets and objects map to database tables via `sqlx::FromRow` row structs
//! and serialize as JSON via `serde`. Rendition types describe transform requests.

pub mod bucket;
pub mod object;
pub mod rendition;

//! HTTP handlers. Each module maps one slice of the surface onto the services.

pub mod admin_handlers;
pub mod auth;
pub mod cdn_handlers;
pub mod conditional;
pub mod health_handlers;
pub mod upload_handlers;

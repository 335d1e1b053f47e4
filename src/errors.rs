use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failures reported by a storage driver, carrying the backend's own message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        Self::new(err.to_string())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Input the caller can fix; messages are shown to users verbatim.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("No file was selected for upload")]
    NoFile,
    #[error("The upload failed: {0}")]
    Upload(String),
    #[error("Could not determine a file extension for the upload")]
    MissingExtension,
    #[error("The extension `{ext}` is not valid for files of type {mime}")]
    ExtensionMimeMismatch { ext: String, mime: String },
    #[error("Files of type `{ext}` are not allowed here; allowed types: {allowed}")]
    ExtensionNotAllowed { ext: String, allowed: String },
    #[error("The file is {size} bytes, larger than the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
    #[error("The image is {width}x{height}; {reason}")]
    BadDimensions {
        width: u32,
        height: u32,
        reason: String,
    },
    #[error("Bucket slug `{slug}` is invalid: {reason}")]
    InvalidSlug { slug: String, reason: String },
}

/// Reasons a signed URL token was rejected. Clients only ever see "invalid token".
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is not valid base64")]
    Encoding,
    #[error("token could not be decrypted")]
    Decrypt,
    #[error("token payload is malformed")]
    Format,
    #[error("token hash does not match")]
    Hash,
    #[error("token has expired")]
    Expired,
}

impl TokenError {
    /// Numeric reason for logs and diagnostics.
    pub fn code(&self) -> u8 {
        match self {
            TokenError::Encoding => 1,
            TokenError::Decrypt => 2,
            TokenError::Format => 3,
            TokenError::Hash => 4,
            TokenError::Expired => 5,
        }
    }
}

/// Image library failures. Never surfaced as a server error.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("source image is empty")]
    EmptySource,
    #[error("invalid target size {0}x{1}")]
    InvalidSize(u32, u32),
}

#[derive(Debug, Error)]
pub enum CdnError {
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage driver failed to {op} `{target}`: {source}")]
    Driver {
        op: &'static str,
        target: String,
        #[source]
        source: DriverError,
    },
    #[error("image transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("bucket `{slug}` is not empty: {failures} object(s) could not be purged")]
    BucketNotEmpty { slug: String, failures: usize },
    #[error("unknown MIME type `{0}`")]
    UnknownMime(String),
    #[error("unknown storage driver `{0}`")]
    UnknownDriver(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CdnError {
    pub fn driver(op: &'static str, target: impl Into<String>, source: DriverError) -> Self {
        CdnError::Driver {
            op,
            target: target.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CdnError::NotFound(_))
    }
}

pub type CdnResult<T> = Result<T, CdnError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub error: Option<String>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            error: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "A valid admin token is required")
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "status": self.status.as_u16(),
            "message": self.message,
        });
        if let Some(error) = self.error {
            body["error"] = json!(error);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<CdnError> for AppError {
    fn from(err: CdnError) -> Self {
        match &err {
            CdnError::NotFound(_) => AppError::not_found(err.to_string()),
            CdnError::Validation(_) | CdnError::UnknownMime(_) => {
                AppError::bad_request(err.to_string())
            }
            CdnError::Token(reason) => {
                tracing::info!(reason = reason.code(), "rejected token: {}", reason);
                AppError::new(StatusCode::FORBIDDEN, "invalid token")
            }
            CdnError::BucketNotEmpty { .. } | CdnError::Conflict(_) => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            CdnError::Driver { .. } => {
                tracing::error!("{}", err);
                AppError::internal("storage driver failure").with_error(err.to_string())
            }
            CdnError::Transform(_)
            | CdnError::UnknownDriver(_)
            | CdnError::Sqlx(_)
            | CdnError::Io(_) => {
                tracing::error!("{}", err);
                AppError::internal("internal error").with_error(err.to_string())
            }
        }
    }
}

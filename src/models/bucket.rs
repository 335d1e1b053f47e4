//! Represents a logical bucket — a named partition of objects with its own upload policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A bucket and its upload policy.
///
/// An empty `allowed_extensions` list allows every extension and a
/// `max_size_bytes` of zero means no size limit.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Bucket {
    pub id: i64,

    /// URL-safe unique name, referenced by every object URL.
    pub slug: String,

    pub label: String,

    pub allowed_extensions: Vec<String>,

    pub max_size_bytes: i64,

    /// Live object count, present when the bucket was loaded with aggregation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_count: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub created_by: Option<i64>,
    pub modified_at: DateTime<Utc>,
    pub modified_by: Option<i64>,
}

impl Bucket {
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_extensions.is_empty()
    }
}

#[derive(FromRow, Debug)]
pub struct BucketRow {
    pub id: i64,
    pub slug: String,
    pub label: String,
    pub allowed_extensions: String,
    pub max_size_bytes: i64,
    pub object_count: Option<i64>,
    pub created: DateTime<Utc>,
    pub created_by: Option<i64>,
    pub modified: DateTime<Utc>,
    pub modified_by: Option<i64>,
}

impl From<BucketRow> for Bucket {
    fn from(row: BucketRow) -> Self {
        Bucket {
            id: row.id,
            slug: row.slug,
            label: row.label,
            allowed_extensions: split_extensions(&row.allowed_extensions),
            max_size_bytes: row.max_size_bytes,
            object_count: row.object_count,
            created_at: row.created,
            created_by: row.created_by,
            modified_at: row.modified,
            modified_by: row.modified_by,
        }
    }
}

/// Parameters for creating a bucket.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewBucket {
    pub slug: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub max_size_bytes: i64,
    #[serde(skip)]
    pub created_by: Option<i64>,
}

impl NewBucket {
    pub fn unrestricted(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            ..Self::default()
        }
    }
}

fn split_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ext| !ext.is_empty())
        .map(str::to_string)
        .collect()
}

//! Represents an object (file) stored in a bucket, live or trashed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

/// Image orientation derived from width and height.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
}

impl Orientation {
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        match width.cmp(&height) {
            std::cmp::Ordering::Greater => Orientation::Landscape,
            std::cmp::Ordering::Less => Orientation::Portrait,
            std::cmp::Ordering::Equal => Orientation::Square,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Landscape => "LANDSCAPE",
            Orientation::Portrait => "PORTRAIT",
            Orientation::Square => "SQUARE",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "LANDSCAPE" => Some(Orientation::Landscape),
            "PORTRAIT" => Some(Orientation::Portrait),
            "SQUARE" => Some(Orientation::Square),
            _ => None,
        }
    }
}

/// Anchor used when a crop-fill overflows the target box.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CropQuadrant {
    #[default]
    #[serde(rename = "C")]
    Center,
    #[serde(rename = "T")]
    Top,
    #[serde(rename = "B")]
    Bottom,
    #[serde(rename = "L")]
    Left,
    #[serde(rename = "R")]
    Right,
}

impl CropQuadrant {
    pub fn letter(&self) -> char {
        match self {
            CropQuadrant::Center => 'C',
            CropQuadrant::Top => 'T',
            CropQuadrant::Bottom => 'B',
            CropQuadrant::Left => 'L',
            CropQuadrant::Right => 'R',
        }
    }

    /// Offset of the crop window given the overflow on each axis.
    pub fn offset(&self, overflow_x: u32, overflow_y: u32) -> (u32, u32) {
        match self {
            CropQuadrant::Center => (overflow_x / 2, overflow_y / 2),
            CropQuadrant::Top => (overflow_x / 2, 0),
            CropQuadrant::Bottom => (overflow_x / 2, overflow_y),
            CropQuadrant::Left => (0, overflow_y / 2),
            CropQuadrant::Right => (overflow_x, overflow_y / 2),
        }
    }
}

impl FromStr for CropQuadrant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "C" | "CENTER" => Ok(CropQuadrant::Center),
            "T" | "TOP" => Ok(CropQuadrant::Top),
            "B" | "BOTTOM" => Ok(CropQuadrant::Bottom),
            "L" | "LEFT" => Ok(CropQuadrant::Left),
            "R" | "RIGHT" => Ok(CropQuadrant::Right),
            other => Err(format!("unknown crop quadrant `{}`", other)),
        }
    }
}

impl fmt::Display for CropQuadrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Usage counters kept per object.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub serves: i64,
    pub downloads: i64,
    pub thumbs: i64,
    pub scales: i64,
}

/// Which usage counter a request bumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterKind {
    Serve,
    Download,
    Thumb,
    Scale,
    Crop,
}

impl CounterKind {
    /// Column holding the counter. Crops are counted as thumbs.
    pub fn column(&self) -> &'static str {
        match self {
            CounterKind::Serve => "count_serve",
            CounterKind::Download => "count_download",
            CounterKind::Thumb | CounterKind::Crop => "count_thumb",
            CounterKind::Scale => "count_scale",
        }
    }
}

/// Image facts captured at upload.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub orientation: Orientation,
    pub is_animated: bool,
}

/// Bucket fields embedded in an object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketRef {
    pub id: i64,
    pub slug: String,
    pub label: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrashInfo {
    pub trashed_at: DateTime<Utc>,
    pub trashed_by: Option<i64>,
}

/// A stored binary plus its metadata.
///
/// `filename` is the opaque generated disk name; `display_filename` is what
/// the uploader called it.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Object {
    pub id: i64,
    pub bucket: BucketRef,
    pub filename: String,
    pub display_filename: String,
    pub mime: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub driver: String,
    pub image: Option<ImageInfo>,
    pub counters: Counters,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<i64>,
    pub modified_at: DateTime<Utc>,
    pub modified_by: Option<i64>,
    pub trash: Option<TrashInfo>,
}

impl Object {
    pub fn is_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn is_trashed(&self) -> bool {
        self.trash.is_some()
    }

    pub fn orientation(&self) -> Option<Orientation> {
        self.image.map(|img| img.orientation)
    }
}

/// Raw row shape shared by the `objects` and `objects_trash` selects.
#[derive(FromRow, Debug)]
pub struct ObjectRow {
    pub id: i64,
    pub bucket_id: i64,
    pub bucket_slug: String,
    pub bucket_label: String,
    pub filename: String,
    pub display_filename: String,
    pub mime: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub driver: String,
    pub is_image: bool,
    pub img_width: Option<i64>,
    pub img_height: Option<i64>,
    pub img_orientation: Option<String>,
    pub is_animated: bool,
    pub count_serve: i64,
    pub count_download: i64,
    pub count_thumb: i64,
    pub count_scale: i64,
    pub created: DateTime<Utc>,
    pub created_by: Option<i64>,
    pub modified: DateTime<Utc>,
    pub modified_by: Option<i64>,
    pub trashed: Option<DateTime<Utc>>,
    pub trashed_by: Option<i64>,
}

impl From<ObjectRow> for Object {
    fn from(row: ObjectRow) -> Self {
        let image = match (row.is_image, row.img_width, row.img_height) {
            (true, Some(w), Some(h)) => {
                let (width, height) = (w.max(0) as u32, h.max(0) as u32);
                Some(ImageInfo {
                    width,
                    height,
                    orientation: row
                        .img_orientation
                        .as_deref()
                        .and_then(Orientation::parse)
                        .unwrap_or_else(|| Orientation::from_dimensions(width, height)),
                    is_animated: row.is_animated,
                })
            }
            _ => None,
        };

        Object {
            id: row.id,
            bucket: BucketRef {
                id: row.bucket_id,
                slug: row.bucket_slug,
                label: row.bucket_label,
            },
            filename: row.filename,
            display_filename: row.display_filename,
            mime: row.mime,
            size_bytes: row.size_bytes,
            content_hash: row.content_hash,
            driver: row.driver,
            image,
            counters: Counters {
                serves: row.count_serve,
                downloads: row.count_download,
                thumbs: row.count_thumb,
                scales: row.count_scale,
            },
            created_at: row.created,
            created_by: row.created_by,
            modified_at: row.modified,
            modified_by: row.modified_by,
            trash: row.trashed.map(|trashed_at| TrashInfo {
                trashed_at,
                trashed_by: row.trashed_by,
            }),
        }
    }
}

/// Attributes for a new live object row.
#[derive(Clone, Debug)]
pub struct NewObject {
    pub bucket_id: i64,
    pub filename: String,
    pub display_filename: String,
    pub mime: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub driver: String,
    pub image: Option<ImageInfo>,
    pub created_by: Option<i64>,
}

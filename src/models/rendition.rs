//! Rendition request vocabulary: transform kinds and generated-image parameters.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::object::CounterKind;

/// The transform a rendition was produced by. Part of every cache key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformKind {
    Crop,
    Scale,
    Thumb,
    Placeholder,
    BlankAvatar,
}

impl TransformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::Crop => "CROP",
            TransformKind::Scale => "SCALE",
            TransformKind::Thumb => "THUMB",
            TransformKind::Placeholder => "PLACEHOLDER",
            TransformKind::BlankAvatar => "BLANK_AVATAR",
        }
    }

    /// Crop-style kinds fill the box; everything else fits inside it.
    pub fn fills_box(&self) -> bool {
        matches!(self, TransformKind::Crop | TransformKind::Thumb)
    }

    /// Counter bumped when this kind of rendition is served.
    pub fn counter(&self) -> Option<CounterKind> {
        match self {
            TransformKind::Crop => Some(CounterKind::Crop),
            TransformKind::Thumb => Some(CounterKind::Thumb),
            TransformKind::Scale => Some(CounterKind::Scale),
            TransformKind::Placeholder | TransformKind::BlankAvatar => None,
        }
    }
}

/// Which built-in silhouette a blank avatar uses.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AvatarSex {
    Male,
    Female,
    Unknown,
}

impl AvatarSex {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvatarSex::Male => "male",
            AvatarSex::Female => "female",
            AvatarSex::Unknown => "unknown",
        }
    }
}

impl FromStr for AvatarSex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m" | "male" => Ok(AvatarSex::Male),
            "f" | "female" => Ok(AvatarSex::Female),
            "u" | "unknown" | "x" => Ok(AvatarSex::Unknown),
            other => Err(format!("unknown avatar type `{}`", other)),
        }
    }
}

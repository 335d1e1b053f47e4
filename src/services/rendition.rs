//! Rendition cache naming and the on-disk directory that holds renditions.
//!
//! Object renditions are named `{bucket}-{stem}-{KIND}-{w}x{h}[-{Q}].{ext}`,
//! where `Q` is the crop quadrant letter, omitted for centre crops so older
//! cache files keep matching. Generated images use `PLACEHOLDER-{w}x{h}-{border}.png`
//! and `BLANK_AVATAR-{sex}-{w}x{h}.png`. The ETag of a rendition is the md5 of
//! its name.

use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{image_transformer::OutputFormat, mime_registry};
use crate::models::{
    object::CropQuadrant,
    rendition::{AvatarSex, TransformKind},
};

/// Kinds whose renditions derive from a stored object.
const OBJECT_KINDS: [TransformKind; 3] = [
    TransformKind::Crop,
    TransformKind::Scale,
    TransformKind::Thumb,
];

const TRASHED_SUFFIX: &str = "TRASHED";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    format: OutputFormat,
}

impl CacheKey {
    pub fn for_object(
        bucket: &str,
        filename: &str,
        kind: TransformKind,
        width: u32,
        height: u32,
        quadrant: CropQuadrant,
    ) -> Self {
        let stem = safe_stem(filename);
        let ext = mime_registry::extension_of(filename).unwrap_or_default();
        let format = OutputFormat::for_extension(&ext);

        let mut name = format!(
            "{}-{}-{}-{}x{}",
            bucket,
            stem,
            kind.as_str(),
            width,
            height
        );
        if kind.fills_box() && quadrant != CropQuadrant::Center {
            name.push('-');
            name.push(quadrant.letter());
        }
        name.push('.');
        name.push_str(format.extension());

        Self { name, format }
    }

    /// The same rendition rendered from a trashed source. Kept apart from the
    /// public key so anonymous requests never see it; still matched by
    /// `invalidate_object`.
    pub fn from_trash(self) -> Self {
        let ext = self.format.extension();
        let stem = self
            .name
            .strip_suffix(&format!(".{}", ext))
            .unwrap_or(&self.name);
        Self {
            name: format!("{}-{}.{}", stem, TRASHED_SUFFIX, ext),
            format: self.format,
        }
    }

    pub fn placeholder(width: u32, height: u32, border: u32) -> Self {
        Self {
            name: format!(
                "{}-{}x{}-{}.png",
                TransformKind::Placeholder.as_str(),
                width,
                height,
                border
            ),
            format: OutputFormat::Png,
        }
    }

    pub fn blank_avatar(width: u32, height: u32, sex: AvatarSex) -> Self {
        Self {
            name: format!(
                "{}-{}-{}x{}.png",
                TransformKind::BlankAvatar.as_str(),
                sex.as_str(),
                width,
                height
            ),
            format: OutputFormat::Png,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Unquoted md5 of the file name.
    pub fn etag(&self) -> String {
        format!("{:x}", md5::compute(self.name.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Filename without its extension, with path separators neutralised.
fn safe_stem(filename: &str) -> String {
    let stem = match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    };
    stem.replace(['/', '\\'], "_")
}

/// Split an `@Nx` retina suffix off a requested filename.
///
/// Both `name@2x.jpg` and `name.jpg@2x` are accepted. The multiplier is capped
/// at `max`; a filename without a valid suffix comes back unchanged with 1.
pub fn parse_retina(filename: &str, max: u32) -> (String, u32) {
    fn multiplier(raw: &str) -> Option<u32> {
        raw.strip_suffix('x')
            .or_else(|| raw.strip_suffix('X'))?
            .parse::<u32>()
            .ok()
            .filter(|n| *n >= 1)
    }

    let Some(at) = filename.rfind('@') else {
        return (filename.to_string(), 1);
    };
    let (before, after) = (&filename[..at], &filename[at + 1..]);

    // name.jpg@2x
    if let Some(n) = multiplier(after) {
        return (before.to_string(), n.min(max.max(1)));
    }
    // name@2x.jpg
    if let Some((suffix, ext)) = after.split_once('.') {
        if let Some(n) = multiplier(suffix) {
            return (format!("{}.{}", before, ext), n.min(max.max(1)));
        }
    }
    (filename.to_string(), 1)
}

/// The directory renditions are written into.
#[derive(Clone, Debug)]
pub struct RenditionDir {
    root: PathBuf,
}

impl RenditionDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Unique sibling of the final path; renamed into place once complete.
    pub fn temp_path_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(format!(".tmp-{}-{}", Uuid::new_v4(), key.file_name()))
    }

    /// Best-effort removal of every object rendition derived from `filename`
    /// in `bucket`. Returns how many files were unlinked.
    pub async fn invalidate_object(&self, bucket: &str, filename: &str) -> usize {
        let prefix = format!("{}-{}-", bucket, safe_stem(filename));
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(bucket, filename, "cannot list rendition cache: {}", err);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(bucket, filename, "rendition cache listing failed: {}", err);
                    break;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let derived = OBJECT_KINDS
                .iter()
                .any(|kind| rest.starts_with(&format!("{}-", kind.as_str())));
            if !derived {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(bucket, filename, rendition = name, "failed to unlink rendition: {}", err),
            }
        }

        if removed > 0 {
            debug!(bucket, filename, removed, "invalidated renditions");
        }
        removed
    }
}

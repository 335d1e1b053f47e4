//! Extension ↔ MIME mapping.
//!
//! A static many-to-many table: the first extension listed for a MIME type is
//! its canonical extension, and the first MIME type listing an extension wins
//! for reverse lookups. The derived maps are built lazily once per process.

use std::{collections::HashMap, sync::LazyLock};

use crate::errors::{CdnError, CdnResult};

pub const DEFAULT_MIME: &str = "application/octet-stream";

const MIME_TABLE: &[(&str, &[&str])] = &[
    ("image/jpeg", &["jpg", "jpe"]),
    ("image/pjpeg", &["jpg"]),
    ("image/png", &["png"]),
    ("image/x-png", &["png"]),
    ("image/gif", &["gif"]),
    ("image/webp", &["webp"]),
    ("image/bmp", &["bmp"]),
    ("image/x-ms-bmp", &["bmp"]),
    ("image/tiff", &["tiff"]),
    ("image/svg+xml", &["svg"]),
    ("image/x-icon", &["ico"]),
    ("image/vnd.microsoft.icon", &["ico"]),
    ("application/pdf", &["pdf"]),
    ("application/zip", &["zip"]),
    ("application/x-zip-compressed", &["zip"]),
    ("application/gzip", &["gz", "tgz"]),
    ("application/x-gzip", &["gz", "tgz"]),
    ("application/x-tar", &["tar"]),
    ("application/json", &["json"]),
    ("application/xml", &["xml"]),
    ("text/xml", &["xml"]),
    ("text/plain", &["txt", "text", "log", "md", "csv"]),
    ("text/csv", &["csv", "txt"]),
    ("text/html", &["html"]),
    ("text/css", &["css"]),
    ("text/markdown", &["md"]),
    ("application/javascript", &["js"]),
    ("text/javascript", &["js"]),
    ("application/msword", &["doc"]),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        &["docx"],
    ),
    ("application/vnd.ms-excel", &["xls"]),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        &["xlsx"],
    ),
    ("application/vnd.ms-powerpoint", &["ppt"]),
    (
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        &["pptx"],
    ),
    ("application/vnd.oasis.opendocument.text", &["odt"]),
    ("application/epub+zip", &["epub"]),
    ("audio/mpeg", &["mp3"]),
    ("audio/ogg", &["ogg", "oga"]),
    ("audio/wav", &["wav"]),
    ("video/mp4", &["mp4", "m4v"]),
    ("video/webm", &["webm"]),
    ("video/quicktime", &["mov"]),
    ("video/mpeg", &["mpg"]),
    ("font/woff", &["woff"]),
    ("font/woff2", &["woff2"]),
    (DEFAULT_MIME, &["bin", "exe", "dat"]),
];

const EXTENSION_ALIASES: &[(&str, &str)] = &[
    ("jpeg", "jpg"),
    ("jfif", "jpg"),
    ("tif", "tiff"),
    ("htm", "html"),
    ("mpeg", "mpg"),
    ("markdown", "md"),
];

/// Container formats a magic sniff cannot tell apart from their contents.
const ZIP_CONTAINERS: &[&str] = &["docx", "xlsx", "pptx", "odt", "epub", "jar"];

struct MimeMaps {
    ext_to_mime: HashMap<&'static str, &'static str>,
    mime_to_exts: HashMap<&'static str, Vec<&'static str>>,
}

static MAPS: LazyLock<MimeMaps> = LazyLock::new(|| {
    let mut ext_to_mime = HashMap::new();
    let mut mime_to_exts: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
    for (mime, exts) in MIME_TABLE {
        for ext in *exts {
            ext_to_mime.entry(*ext).or_insert(*mime);
            mime_to_exts.entry(*mime).or_default().push(*ext);
        }
    }
    MimeMaps {
        ext_to_mime,
        mime_to_exts,
    }
});

fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Lower-case, trim, drop a leading dot and apply the alias table.
pub fn sanitize_extension(ext: &str) -> String {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    EXTENSION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == ext)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(ext)
}

pub fn extension_for_mime(mime: &str) -> CdnResult<&'static str> {
    MAPS.mime_to_exts
        .get(normalize_mime(mime).as_str())
        .and_then(|exts| exts.first().copied())
        .ok_or_else(|| CdnError::UnknownMime(mime.to_string()))
}

pub fn mime_for_extension(ext: &str) -> &'static str {
    MAPS.ext_to_mime
        .get(sanitize_extension(ext).as_str())
        .copied()
        .unwrap_or(DEFAULT_MIME)
}

pub fn is_extension_valid_for_mime(ext: &str, mime: &str) -> bool {
    let ext = sanitize_extension(ext);
    MAPS.mime_to_exts
        .get(normalize_mime(mime).as_str())
        .map(|exts| exts.iter().any(|candidate| *candidate == ext))
        .unwrap_or(false)
}

pub fn is_image_mime(mime: &str) -> bool {
    let mime = normalize_mime(mime);
    mime.starts_with("image/") && mime != "image/svg+xml"
}

/// Extension part of a filename, sanitized.
pub fn extension_of(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(sanitize_extension(ext))
}

/// Identify content from its leading bytes, the way `finfo` would.
///
/// Returns `None` when the bytes carry no recognisable signature.
pub fn sniff(bytes: &[u8]) -> Option<&'static str> {
    if let Ok(format) = image::guess_format(bytes) {
        return Some(format.to_mime_type());
    }
    if bytes.starts_with(b"%PDF-") {
        return Some("application/pdf");
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return Some("application/zip");
    }
    if bytes.starts_with(&[0x1f, 0x8b]) {
        return Some("application/gzip");
    }
    if bytes.starts_with(b"<svg") || (bytes.starts_with(b"<?xml") && contains(bytes, b"<svg")) {
        return Some("image/svg+xml");
    }
    if !bytes.is_empty() && std::str::from_utf8(bytes).is_ok() {
        return Some("text/plain");
    }
    None
}

/// Reconcile a sniffed MIME type with the extension the caller asked for.
///
/// Plain-text and zip signatures are too generic to contradict a more specific
/// extension, so those defer to the extension's own MIME type.
pub fn refine_detected(detected: Option<&str>, ext: &str) -> String {
    let by_ext = mime_for_extension(ext);
    match detected {
        None => by_ext.to_string(),
        Some("text/plain") if by_ext.starts_with("text/") || by_ext.ends_with("json") => {
            by_ext.to_string()
        }
        Some("application/zip") if ZIP_CONTAINERS.contains(&sanitize_extension(ext).as_str()) => {
            by_ext.to_string()
        }
        Some(mime) => mime.to_string(),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .take(1024)
        .any(|window| window == needle)
}

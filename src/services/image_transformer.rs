//! Stateless image operations: probing, crop-fill, fit-within, animated GIF
//! re-rendering and the generated images (placeholder, blank avatar, broken source).
//!
//! Every function here is pure with respect to its inputs: the same bytes and
//! the same `RenderJob` always produce byte-identical output, which the
//! rendition cache relies on.

use image::{
    AnimationDecoder, DynamicImage, Frame, GenericImageView, ImageFormat, ImageReader, Rgba,
    RgbaImage,
    codecs::{
        gif::{GifDecoder, GifEncoder, Repeat},
        jpeg::JpegEncoder,
    },
    imageops::FilterType,
};
use std::io::Cursor;

use crate::{
    errors::TransformError,
    models::{
        object::{CropQuadrant, ImageInfo, Orientation},
        rendition::AvatarSex,
    },
};

pub const JPEG_QUALITY: u8 = 80;

/// Upper bound on either side of a generated image.
pub const MAX_GENERATED_SIDE: u32 = 4096;

/// How the source is fitted into the target box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitMode {
    /// Fill the box exactly, cropping overflow around the anchor.
    Fill(CropQuadrant),
    /// Fit inside the box preserving aspect ratio; never enlarges.
    Fit,
}

/// Encoded format of a rendition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
}

impl OutputFormat {
    /// Output format for a source extension; unusual formats re-encode as PNG.
    pub fn for_extension(ext: &str) -> Self {
        match ext {
            "jpg" => OutputFormat::Jpeg,
            "gif" => OutputFormat::Gif,
            "webp" => OutputFormat::WebP,
            _ => OutputFormat::Png,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Gif => "gif",
            OutputFormat::WebP => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Gif => "image/gif",
            OutputFormat::WebP => "image/webp",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderJob {
    pub mode: FitMode,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
}

/// Dimensions, orientation and animation flag, read without a full decode.
pub fn probe(bytes: &[u8]) -> Option<ImageInfo> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let (width, height) = reader.into_dimensions().ok()?;
    Some(ImageInfo {
        width,
        height,
        orientation: Orientation::from_dimensions(width, height),
        is_animated: is_animated_gif(bytes),
    })
}

/// Heuristic animation check: two or more graphic control extension blocks,
/// each followed by an image descriptor or another extension.
pub fn is_animated_gif(bytes: &[u8]) -> bool {
    if !bytes.starts_with(b"GIF8") {
        return false;
    }
    let mut blocks = 0;
    let mut i = 0;
    while i + 10 <= bytes.len() {
        let window = &bytes[i..i + 10];
        if window[0] == 0x00
            && window[1] == 0x21
            && window[2] == 0xF9
            && window[3] == 0x04
            && window[8] == 0x00
            && (window[9] == 0x2C || window[9] == 0x21)
        {
            blocks += 1;
            if blocks >= 2 {
                return true;
            }
            i += 10;
        } else {
            i += 1;
        }
    }
    false
}

/// Render `source` according to `job`, taking the frame-by-frame path for
/// animated GIFs.
pub fn render(source: &[u8], job: &RenderJob) -> Result<Vec<u8>, TransformError> {
    if source.is_empty() {
        return Err(TransformError::EmptySource);
    }
    if job.width == 0 || job.height == 0 {
        return Err(TransformError::InvalidSize(job.width, job.height));
    }
    if job.format == OutputFormat::Gif && is_animated_gif(source) {
        render_animated(source, job)
    } else {
        render_static(source, job)
    }
}

pub fn render_static(source: &[u8], job: &RenderJob) -> Result<Vec<u8>, TransformError> {
    let img = image::load_from_memory(source)?;
    let out = apply(&img, job.mode, job.width, job.height, FilterType::Lanczos3);
    encode(&out, job.format)
}

/// Decode every frame, transform each with the same parameters and
/// re-assemble them with their original delays, looping forever.
pub fn render_animated(source: &[u8], job: &RenderJob) -> Result<Vec<u8>, TransformError> {
    let decoder = GifDecoder::new(Cursor::new(source))?;
    let frames = decoder.into_frames().collect_frames()?;

    let rendered = frames
        .into_iter()
        .map(|frame| {
            let delay = frame.delay();
            let img = DynamicImage::ImageRgba8(frame.into_buffer());
            let out = apply(&img, job.mode, job.width, job.height, FilterType::Triangle);
            Frame::from_parts(out.to_rgba8(), 0, 0, delay)
        })
        .collect::<Vec<_>>();

    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        encoder.set_repeat(Repeat::Infinite)?;
        encoder.encode_frames(rendered)?;
    }
    Ok(buf)
}

fn apply(img: &DynamicImage, mode: FitMode, width: u32, height: u32, filter: FilterType) -> DynamicImage {
    match mode {
        FitMode::Fill(quadrant) => crop_to_fill(img, width, height, quadrant, filter),
        FitMode::Fit => fit_within(img, width, height, filter),
    }
}

/// Scale to cover `width`x`height`, then cut the box out at the quadrant.
pub fn crop_to_fill(
    img: &DynamicImage,
    width: u32,
    height: u32,
    quadrant: CropQuadrant,
    filter: FilterType,
) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();
    if src_w == 0 || src_h == 0 {
        return DynamicImage::new_rgba8(width, height);
    }
    let scale = f64::max(
        f64::from(width) / f64::from(src_w),
        f64::from(height) / f64::from(src_h),
    );
    let scaled_w = ((f64::from(src_w) * scale).round() as u32).max(width);
    let scaled_h = ((f64::from(src_h) * scale).round() as u32).max(height);

    let resized = if (scaled_w, scaled_h) == (src_w, src_h) {
        img.clone()
    } else {
        img.resize_exact(scaled_w, scaled_h, filter)
    };
    let (x, y) = quadrant.offset(scaled_w - width, scaled_h - height);
    resized.crop_imm(x, y, width, height)
}

/// Shrink to fit inside `width`x`height` keeping the aspect ratio.
pub fn fit_within(img: &DynamicImage, width: u32, height: u32, filter: FilterType) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();
    if src_w <= width && src_h <= height {
        return img.clone();
    }
    img.resize(width, height, filter)
}

pub fn encode(img: &DynamicImage, format: OutputFormat) -> Result<Vec<u8>, TransformError> {
    let mut buf = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(&rgb)?;
        }
        OutputFormat::Png => {
            img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        }
        OutputFormat::Gif => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Gif)?;
        }
        OutputFormat::WebP => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::WebP)?;
        }
    }
    Ok(buf)
}

fn clamp_side(side: u32) -> u32 {
    side.clamp(1, MAX_GENERATED_SIDE)
}

/// Checkered grey tiles inside a solid border `border` pixels wide.
pub fn placeholder(width: u32, height: u32, border: u32) -> Result<Vec<u8>, TransformError> {
    const TILE: u32 = 10;
    let (width, height) = (clamp_side(width), clamp_side(height));
    let light = Rgba([0xee, 0xee, 0xee, 0xff]);
    let dark = Rgba([0xdd, 0xdd, 0xdd, 0xff]);
    let edge = Rgba([0x99, 0x99, 0x99, 0xff]);

    let img = RgbaImage::from_fn(width, height, |x, y| {
        let in_border =
            x < border || y < border || x >= width.saturating_sub(border) || y >= height.saturating_sub(border);
        if in_border {
            edge
        } else if ((x / TILE) + (y / TILE)) % 2 == 0 {
            light
        } else {
            dark
        }
    });
    encode(&DynamicImage::ImageRgba8(img), OutputFormat::Png)
}

/// Head-and-shoulders silhouette on a background tinted by `sex`.
pub fn blank_avatar(width: u32, height: u32, sex: AvatarSex) -> Result<Vec<u8>, TransformError> {
    let (width, height) = (clamp_side(width), clamp_side(height));
    let background = match sex {
        AvatarSex::Male => Rgba([0xc5, 0xd8, 0xee, 0xff]),
        AvatarSex::Female => Rgba([0xf2, 0xd0, 0xdc, 0xff]),
        AvatarSex::Unknown => Rgba([0xdd, 0xdd, 0xdd, 0xff]),
    };
    let figure = Rgba([0xff, 0xff, 0xff, 0xff]);

    let (w, h) = (f64::from(width), f64::from(height));
    let head_r = w.min(h) * 0.2;
    let (head_x, head_y) = (w / 2.0, h * 0.38);
    let (body_rx, body_ry) = (w * 0.36, h * 0.3);
    let (body_x, body_y) = (w / 2.0, h * 1.0);
    // Wider shoulders on the male silhouette, longer hair line on the female one.
    let shoulder = match sex {
        AvatarSex::Male => 1.1,
        AvatarSex::Female => 0.9,
        AvatarSex::Unknown => 1.0,
    };

    let img = RgbaImage::from_fn(width, height, |x, y| {
        let (px, py) = (f64::from(x) + 0.5, f64::from(y) + 0.5);
        let head = (px - head_x).powi(2) + (py - head_y).powi(2) <= head_r.powi(2);
        let hair = sex == AvatarSex::Female
            && (px - head_x).abs() <= head_r * 1.15
            && py >= head_y
            && py <= head_y + head_r * 1.4;
        let body = ((px - body_x) / (body_rx * shoulder)).powi(2)
            + ((py - body_y) / body_ry).powi(2)
            <= 1.0;
        if head || hair || body { figure } else { background }
    });
    encode(&DynamicImage::ImageRgba8(img), OutputFormat::Png)
}

/// Grey field crossed in red, sized to the request it stands in for.
pub fn bad_source(width: u32, height: u32) -> Result<Vec<u8>, TransformError> {
    let (width, height) = (clamp_side(width), clamp_side(height));
    let field = Rgba([0xf0, 0xf0, 0xf0, 0xff]);
    let cross = Rgba([0xd0, 0x30, 0x30, 0xff]);
    let thickness = (width.min(height) / 25).max(1) as f64;
    let (w, h) = (f64::from(width), f64::from(height));
    let diag = (w * w + h * h).sqrt();

    let img = RgbaImage::from_fn(width, height, |x, y| {
        let (px, py) = (f64::from(x), f64::from(y));
        // Distance from each diagonal.
        let d1 = (h * px - w * py).abs() / diag;
        let d2 = (h * px + w * py - w * h).abs() / diag;
        if d1 <= thickness || d2 <= thickness { cross } else { field }
    });
    encode(&DynamicImage::ImageRgba8(img), OutputFormat::Png)
}

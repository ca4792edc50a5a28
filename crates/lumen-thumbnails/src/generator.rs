use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage, RgbaImage};
use tracing::debug;

use lumen_core::asset::RepresentationKind;
use lumen_core::codec;
use lumen_core::image_buf::{ImageBuf, PixelLayout};

pub const PREVIEW_LONGEST_EDGE: u32 = 2048;
pub const THUMBNAIL_LONGEST_EDGE: u32 = 512;

const JPEG_QUALITY: u8 = 90;

pub fn longest_edge(kind: RepresentationKind) -> u32 {
    match kind {
        RepresentationKind::Preview => PREVIEW_LONGEST_EDGE,
        RepresentationKind::Thumbnail => THUMBNAIL_LONGEST_EDGE,
    }
}

/// Render a representation of `buf` as JPEG. Sources smaller than the
/// target edge are encoded at their own size.
pub fn generate(buf: &ImageBuf, kind: RepresentationKind) -> Result<Vec<u8>> {
    let dynamic = match buf.layout {
        PixelLayout::Rgb8 => DynamicImage::ImageRgb8(
            RgbImage::from_raw(buf.width, buf.height, buf.data.clone())
                .context("failed to create image from buffer")?,
        ),
        PixelLayout::Rgba8 => DynamicImage::ImageRgba8(
            RgbaImage::from_raw(buf.width, buf.height, buf.data.clone())
                .context("failed to create image from buffer")?,
        ),
    };

    let edge = longest_edge(kind);
    let resized = if buf.width.max(buf.height) > edge {
        dynamic.resize(edge, edge, FilterType::Lanczos3)
    } else {
        dynamic
    };

    // JPEG has no alpha channel.
    let rgb = resized.to_rgb8();
    let mut jpeg_bytes = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
        Cursor::new(&mut jpeg_bytes),
        JPEG_QUALITY,
    );
    rgb.write_with_encoder(encoder)
        .with_context(|| format!("encode {kind:?} as JPEG"))?;

    debug!(
        ?kind,
        width = rgb.width(),
        height = rgb.height(),
        size = jpeg_bytes.len(),
        "generated representation"
    );
    Ok(jpeg_bytes)
}

/// Decode an image file and generate one representation of it.
pub fn representation_for_file(path: &Path, kind: RepresentationKind) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let buf = codec::decode(&bytes).with_context(|| format!("decode {}", path.display()))?;
    generate(&buf, kind)
}

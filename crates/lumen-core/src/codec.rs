use std::io::Cursor;

use anyhow::{Context, Result};
use image::ImageEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;

use crate::backend::EncodeFormat;
use crate::image_buf::{ImageBuf, PixelLayout};

/// Decode JPEG, PNG or TIFF bytes. Images with alpha keep it; everything
/// else becomes packed RGB.
pub fn decode(bytes: &[u8]) -> Result<ImageBuf> {
    let img = image::load_from_memory(bytes).context("failed to decode image")?;
    let (w, h) = (img.width(), img.height());
    if img.color().has_alpha() {
        ImageBuf::from_data(w, h, PixelLayout::Rgba8, img.into_rgba8().into_raw())
    } else {
        ImageBuf::from_data(w, h, PixelLayout::Rgb8, img.into_rgb8().into_raw())
    }
}

pub fn encode(image: &ImageBuf, format: EncodeFormat) -> Result<Vec<u8>> {
    let color = match image.layout {
        PixelLayout::Rgb8 => image::ExtendedColorType::Rgb8,
        PixelLayout::Rgba8 => image::ExtendedColorType::Rgba8,
    };
    let mut out = Cursor::new(Vec::new());
    match format {
        EncodeFormat::Jpeg { quality } => {
            // JPEG has no alpha channel.
            let rgb;
            let (data, color) = match image.layout {
                PixelLayout::Rgba8 => {
                    rgb = ImageBuf::from_rgba8(
                        image.width,
                        image.height,
                        PixelLayout::Rgb8,
                        image.data.clone(),
                    )?;
                    (&rgb.data, image::ExtendedColorType::Rgb8)
                }
                PixelLayout::Rgb8 => (&image.data, color),
            };
            JpegEncoder::new_with_quality(&mut out, quality)
                .write_image(data, image.width, image.height, color)
                .context("failed to encode JPEG")?;
        }
        EncodeFormat::Png => {
            PngEncoder::new(&mut out)
                .write_image(&image.data, image.width, image.height, color)
                .context("failed to encode PNG")?;
        }
    }
    Ok(out.into_inner())
}

use serde::{Deserialize, Serialize};

/// Channel packing of an [`ImageBuf`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelLayout {
    Rgb8,
    Rgba8,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            Self::Rgb8 => 3,
            Self::Rgba8 => 4,
        }
    }
}

/// Packed 8-bit sRGB image buffer.
///
/// Pixel data is stored row-major as interleaved RGBRGB... or RGBARGBA...
/// depending on [`PixelLayout`]. Every processing stage allocates a new
/// buffer; nothing mutates a buffer it was handed by reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBuf {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub data: Vec<u8>,
}

impl ImageBuf {
    pub fn new(width: u32, height: u32, layout: PixelLayout) -> Self {
        Self {
            width,
            height,
            layout,
            data: vec![0; width as usize * height as usize * layout.channels()],
        }
    }

    pub fn from_data(
        width: u32,
        height: u32,
        layout: PixelLayout,
        data: Vec<u8>,
    ) -> anyhow::Result<Self> {
        let expected = width as usize * height as usize * layout.channels();
        anyhow::ensure!(
            data.len() == expected,
            "expected {expected} bytes for {width}x{height} {layout:?}, got {}",
            data.len()
        );
        Ok(Self {
            width,
            height,
            layout,
            data,
        })
    }

    /// Build a buffer of the requested layout from RGBA8 bytes, dropping
    /// alpha for [`PixelLayout::Rgb8`].
    pub fn from_rgba8(
        width: u32,
        height: u32,
        layout: PixelLayout,
        rgba: Vec<u8>,
    ) -> anyhow::Result<Self> {
        match layout {
            PixelLayout::Rgba8 => Self::from_data(width, height, layout, rgba),
            PixelLayout::Rgb8 => {
                let mut rgb = Vec::with_capacity(rgba.len() / 4 * 3);
                for px in rgba.chunks_exact(4) {
                    rgb.extend_from_slice(&px[..3]);
                }
                Self::from_data(width, height, layout, rgb)
            }
        }
    }

    pub fn channels(&self) -> usize {
        self.layout.channels()
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_count() == 0
    }

    pub fn row_stride(&self) -> usize {
        self.width as usize * self.channels()
    }

    /// Channels of the pixel at (x, y).
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let c = self.channels();
        let idx = (y as usize * self.width as usize + x as usize) * c;
        &self.data[idx..idx + c]
    }

    /// RGBA8 copy of the pixel data (alpha 255 for RGB sources).
    pub fn to_rgba8(&self) -> Vec<u8> {
        match self.layout {
            PixelLayout::Rgba8 => self.data.clone(),
            PixelLayout::Rgb8 => {
                let mut out = Vec::with_capacity(self.pixel_count() * 4);
                for px in self.data.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                out
            }
        }
    }

    /// Box-downsample by `quality` (a linear scale in (0, 1]).
    /// Returns a clone when no reduction is needed.
    pub fn scaled(&self, quality: f32) -> Self {
        let (w, h) = scaled_dims(self.width, self.height, quality);
        self.resize_box(w, h)
    }

    /// Downsample so the longest edge fits within `max_edge` pixels.
    pub fn downsample(&self, max_edge: u32) -> Self {
        let longest = self.width.max(self.height);
        if longest <= max_edge || longest == 0 {
            return self.clone();
        }
        let scale = max_edge as f32 / longest as f32;
        let (w, h) = scaled_dims(self.width, self.height, scale);
        self.resize_box(w, h)
    }

    fn resize_box(&self, new_w: u32, new_h: u32) -> Self {
        if (new_w, new_h) == (self.width, self.height) || self.is_empty() {
            return self.clone();
        }

        let c = self.channels();
        let sx = self.width as f32 / new_w as f32;
        let sy = self.height as f32 / new_h as f32;
        let mut data = Vec::with_capacity(new_w as usize * new_h as usize * c);
        let mut sums = [0u32; 4];

        for dst_y in 0..new_h {
            let y0 = (dst_y as f32 * sy) as u32;
            let y1 = (((dst_y + 1) as f32 * sy).ceil() as u32).clamp(y0 + 1, self.height);
            for dst_x in 0..new_w {
                let x0 = (dst_x as f32 * sx) as u32;
                let x1 = (((dst_x + 1) as f32 * sx).ceil() as u32).clamp(x0 + 1, self.width);

                sums[..c].fill(0);
                let mut count = 0u32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        for (sum, &v) in sums.iter_mut().zip(self.pixel(x, y)) {
                            *sum += v as u32;
                        }
                        count += 1;
                    }
                }
                for &sum in &sums[..c] {
                    data.push(((sum + count / 2) / count) as u8);
                }
            }
        }

        Self {
            width: new_w,
            height: new_h,
            layout: self.layout,
            data,
        }
    }
}

/// Output dimensions for a linear scale factor. Never returns a zero
/// dimension for a non-empty input, never upscales.
pub fn scaled_dims(width: u32, height: u32, scale: f32) -> (u32, u32) {
    if scale >= 1.0 || width == 0 || height == 0 {
        return (width, height);
    }
    let scale = scale.max(0.0);
    let w = ((width as f32 * scale).round() as u32).clamp(1, width);
    let h = ((height as f32 * scale).round() as u32).clamp(1, height);
    (w, h)
}

//! Histogram and clipping analysis of rendered pixels.

use rayon::prelude::*;

use crate::image_buf::{ImageBuf, PixelLayout};

pub const NUM_BINS: usize = 256;

pub const SHADOW_R: u8 = 1 << 0;
pub const SHADOW_G: u8 = 1 << 1;
pub const SHADOW_B: u8 = 1 << 2;
pub const HIGHLIGHT_R: u8 = 1 << 3;
pub const HIGHLIGHT_G: u8 = 1 << 4;
pub const HIGHLIGHT_B: u8 = 1 << 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Histogram {
    pub r: [u32; NUM_BINS],
    pub g: [u32; NUM_BINS],
    pub b: [u32; NUM_BINS],
    pub max_count: u32,
}

impl Histogram {
    pub fn from_bins(r: [u32; NUM_BINS], g: [u32; NUM_BINS], b: [u32; NUM_BINS]) -> Self {
        let max_count = r
            .iter()
            .chain(g.iter())
            .chain(b.iter())
            .copied()
            .max()
            .unwrap_or(0)
            .max(1);
        Self { r, g, b, max_count }
    }

    /// Number of pixels counted.
    pub fn total(&self) -> u64 {
        self.r.iter().map(|&c| c as u64).sum()
    }
}

/// Which channels clip anywhere in the image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClippingFlags {
    /// R, G, B at 0.
    pub shadows: [bool; 3],
    /// R, G, B at 255.
    pub highlights: [bool; 3],
}

impl ClippingFlags {
    pub fn from_mask(bits: u8) -> Self {
        Self {
            shadows: [bits & SHADOW_R != 0, bits & SHADOW_G != 0, bits & SHADOW_B != 0],
            highlights: [
                bits & HIGHLIGHT_R != 0,
                bits & HIGHLIGHT_G != 0,
                bits & HIGHLIGHT_B != 0,
            ],
        }
    }

    pub fn any_shadow(&self) -> bool {
        self.shadows.iter().any(|&b| b)
    }

    pub fn any_highlight(&self) -> bool {
        self.highlights.iter().any(|&b| b)
    }

    pub fn any(&self) -> bool {
        self.any_shadow() || self.any_highlight()
    }
}

/// One byte per pixel; bits 0-2 mark R/G/B shadow clipping, bits 3-5
/// R/G/B highlight clipping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClippingMap {
    pub width: u32,
    pub height: u32,
    pub bits: Vec<u8>,
    pub flags: ClippingFlags,
}

impl ClippingMap {
    pub fn from_bits(width: u32, height: u32, bits: Vec<u8>) -> Self {
        let union = bits.par_iter().copied().reduce(|| 0, |a, b| a | b);
        Self {
            width,
            height,
            bits,
            flags: ClippingFlags::from_mask(union),
        }
    }

    pub fn at(&self, x: u32, y: u32) -> u8 {
        self.bits[(y * self.width + x) as usize]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Analysis {
    pub histogram: Histogram,
    pub clipping: ClippingMap,
}

/// Clip bits of one pixel. Transparent pixels (rotation fill) never clip.
pub fn clip_bits(px: &[u8]) -> u8 {
    if px.len() == 4 && px[3] == 0 {
        return 0;
    }
    let mut bits = 0;
    for (i, &v) in px[..3].iter().enumerate() {
        if v == 0 {
            bits |= SHADOW_R << i;
        } else if v == 255 {
            bits |= HIGHLIGHT_R << i;
        }
    }
    bits
}

struct Bins {
    r: [u32; NUM_BINS],
    g: [u32; NUM_BINS],
    b: [u32; NUM_BINS],
}

impl Bins {
    fn empty() -> Self {
        Self {
            r: [0; NUM_BINS],
            g: [0; NUM_BINS],
            b: [0; NUM_BINS],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        for i in 0..NUM_BINS {
            self.r[i] += other.r[i];
            self.g[i] += other.g[i];
            self.b[i] += other.b[i];
        }
        self
    }
}

/// CPU histogram and clipping map.
pub fn analyze(image: &ImageBuf) -> Analysis {
    let c = image.channels();
    let has_alpha = image.layout == PixelLayout::Rgba8;

    let bins = image
        .data
        .par_chunks(c * 1024)
        .map(|chunk| {
            let mut bins = Bins::empty();
            for px in chunk.chunks_exact(c) {
                if has_alpha && px[3] == 0 {
                    continue;
                }
                bins.r[px[0] as usize] += 1;
                bins.g[px[1] as usize] += 1;
                bins.b[px[2] as usize] += 1;
            }
            bins
        })
        .reduce(Bins::empty, Bins::merge);

    let bits: Vec<u8> = image.data.par_chunks_exact(c).map(clip_bits).collect();

    Analysis {
        histogram: Histogram::from_bins(bins.r, bins.g, bins.b),
        clipping: ClippingMap::from_bits(image.width, image.height, bits),
    }
}

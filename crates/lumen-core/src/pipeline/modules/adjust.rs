use rayon::prelude::*;

use crate::color::{byte_to_linear, linear_to_srgb, luma, srgb_to_linear, unit_to_byte};
use crate::image_buf::ImageBuf;
use crate::snapshot::{Adjustments, PARAM_EPS};

pub const TONE_LUT_SIZE: usize = 4096;

/// Per-render constants of the develop kernel, derived once from the
/// sliders. The GPU backend uploads the same values so both paths evaluate
/// identical math.
#[derive(Clone, Debug)]
pub struct DevelopParams {
    /// White balance gains multiplied by the exposure factor.
    pub gains: [f32; 3],
    pub vibrance: f32,
    pub saturation: f32,
    /// Linear-in, linear-out luminance LUT. `None` when no tone slider is set.
    pub tone_lut: Option<Box<[f32; TONE_LUT_SIZE]>>,
}

impl DevelopParams {
    pub fn from_adjustments(adj: &Adjustments) -> Self {
        let t = adj.temperature / 100.0;
        let tint = adj.tint / 100.0;
        let exposure = 2.0_f32.powf(adj.exposure);
        Self {
            gains: [
                (1.0 + 0.3 * t) * exposure,
                (1.0 - 0.3 * tint) * exposure,
                (1.0 - 0.3 * t) * exposure,
            ],
            vibrance: adj.vibrance / 100.0,
            saturation: adj.saturation / 100.0,
            tone_lut: adj.has_tone().then(|| Box::new(build_tone_lut(adj))),
        }
    }

    /// Develop one pixel. Input and output are linear light.
    pub fn apply_linear(&self, mut rgb: [f32; 3]) -> [f32; 3] {
        for (c, g) in rgb.iter_mut().zip(self.gains) {
            *c *= g;
        }

        if let Some(lut) = &self.tone_lut {
            let y = luma(rgb[0], rgb[1], rgb[2]);
            if y > 1e-6 {
                let scale = tone_scale(lut, y);
                for c in &mut rgb {
                    *c = (*c * scale).max(0.0);
                }
            }
        }

        if self.vibrance.abs() > PARAM_EPS {
            let mx = rgb[0].max(rgb[1]).max(rgb[2]);
            let mn = rgb[0].min(rgb[1]).min(rgb[2]);
            let sat = if mx > 1e-6 { (mx - mn) / mx } else { 0.0 };
            rgb = scale_chroma(rgb, 1.0 + self.vibrance * (1.0 - sat));
        }

        if self.saturation.abs() > PARAM_EPS {
            rgb = scale_chroma(rgb, 1.0 + self.saturation);
        }

        rgb
    }
}

fn scale_chroma(rgb: [f32; 3], factor: f32) -> [f32; 3] {
    let y = luma(rgb[0], rgb[1], rgb[2]);
    rgb.map(|c| (y + (c - y) * factor).max(0.0))
}

/// Global adjustments: white balance, exposure, the tone sliders,
/// vibrance and saturation. Alpha is passed through.
pub fn adjust(input: &ImageBuf, adjustments: &Adjustments) -> ImageBuf {
    if adjustments.is_identity() {
        return input.clone();
    }
    let params = DevelopParams::from_adjustments(adjustments);
    let c = input.channels();
    let mut out = input.clone();

    out.data.par_chunks_mut(c).for_each(|px| {
        let lin = params.apply_linear([
            byte_to_linear(px[0]),
            byte_to_linear(px[1]),
            byte_to_linear(px[2]),
        ]);
        for (dst, v) in px.iter_mut().zip(lin) {
            *dst = unit_to_byte(linear_to_srgb(v.clamp(0.0, 1.0)));
        }
    });
    out
}

// ── Zone layout ──────────────────────────────────────────────────────────
//
// The LUT is built in perceptual (sRGB) space. Five zones:
//
// ```text
//   perceptual 0.00─0.15  Blacks region  (power curve with black-point lift)
//              0.10─0.35  Shadow zone    (power curve, gamma varies)
//              0.35─0.65  Midtone gap    (identity, only contrast S-curve)
//              0.65─0.90  Highlight zone (power curve, gamma varies)
//              0.85─1.00  Whites region  (power curve, white point pinned)
//              full range: Contrast S-curve overlay (x^a / (x^a + (1-x)^a))
// ```
//
// gamma < 1 lifts (positive slider), gamma > 1 crushes (negative slider).
// Zone boundaries are feathered over 5%.

const SHADOW_LO: f32 = 0.10;
const SHADOW_HI: f32 = 0.35;
const HIGHLIGHT_LO: f32 = 0.65;
const HIGHLIGHT_HI: f32 = 0.90;
const BLACKS_HI: f32 = 0.15;
const WHITES_LO: f32 = 0.85;
const FEATHER: f32 = 0.05;

/// Power-curve remap of `t` inside `[lo, hi]`, feathered back to identity
/// on both sides.
fn zone(t: f32, base: f32, lo: f32, hi: f32, gamma: f32) -> f32 {
    if t <= lo - FEATHER || t >= hi + FEATHER {
        return base;
    }
    let width = hi - lo;
    let n = ((t - lo) / width).clamp(0.0, 1.0);
    let val = lo + n.powf(gamma) * width;
    if t <= lo {
        let blend = feather((t - (lo - FEATHER)) / FEATHER);
        base * (1.0 - blend) + val * blend
    } else if t >= hi {
        let blend = feather((t - hi) / FEATHER);
        val * (1.0 - blend) + t * blend
    } else {
        val
    }
}

pub fn build_tone_lut(adj: &Adjustments) -> [f32; TONE_LUT_SIZE] {
    let contrast = adj.contrast / 100.0;
    let highlights = adj.highlights / 100.0;
    let shadows = adj.shadows / 100.0;
    let whites = adj.whites / 100.0;
    let blacks = adj.blacks / 100.0;

    let mut lut = [0.0_f32; TONE_LUT_SIZE];

    for (i, entry) in lut.iter_mut().enumerate() {
        let t = linear_to_srgb(i as f32 / (TONE_LUT_SIZE - 1) as f32);
        let mut out = t;

        if shadows != 0.0 {
            out = zone(t, out, SHADOW_LO, SHADOW_HI, 3.0_f32.powf(-shadows));
        }
        if highlights != 0.0 {
            out = zone(t, out, HIGHLIGHT_LO, HIGHLIGHT_HI, 3.0_f32.powf(-highlights));
        }

        // Whites: n^gamma over [WHITES_LO, 1] keeps 1.0 fixed and bends the
        // approach to it.
        if whites != 0.0 && out > WHITES_LO - FEATHER {
            let gamma = 3.0_f32.powf(-whites);
            let width = 1.0 - WHITES_LO;
            let n = ((out - WHITES_LO) / width).clamp(0.0, 1.0);
            let whites_val = WHITES_LO + n.powf(gamma) * width;
            if out <= WHITES_LO {
                let blend = feather((out - (WHITES_LO - FEATHER)) / FEATHER);
                out = out * (1.0 - blend) + whites_val * blend;
            } else {
                out = whites_val;
            }
        }

        if contrast != 0.0 {
            out = s_curve(out, 3.0_f32.powf(contrast));
        }

        if blacks != 0.0 && out < BLACKS_HI + FEATHER {
            let gamma = 3.0_f32.powf(-blacks);
            let lift = blacks.max(0.0) * 0.10;
            let range = BLACKS_HI - lift;
            let n = (out / BLACKS_HI).clamp(0.0, 1.0);
            let blacks_val = lift + n.powf(gamma) * range;

            if out >= BLACKS_HI {
                let blend = feather((out - BLACKS_HI) / FEATHER);
                out = blacks_val * (1.0 - blend) + out * blend;
            } else {
                out = blacks_val;
            }
        }

        *entry = srgb_to_linear(out.clamp(0.0, 1.0));
    }

    for i in 1..TONE_LUT_SIZE {
        if lut[i] < lut[i - 1] {
            lut[i] = lut[i - 1];
        }
    }

    lut
}

/// Multiplier that maps luminance `y` through the LUT. Above 1.0 the LUT
/// is extended along its top slope.
pub fn tone_scale(lut: &[f32; TONE_LUT_SIZE], y: f32) -> f32 {
    if y <= 1.0 {
        return lut_lerp(lut, y) / y;
    }
    let top = lut[TONE_LUT_SIZE - 1];
    let slope = (lut[TONE_LUT_SIZE - 1] - lut[TONE_LUT_SIZE - 2]) * (TONE_LUT_SIZE - 1) as f32;
    ((top + slope * (y - 1.0)) / y).max(0.0)
}

/// x^a / (x^a + (1-x)^a). Identity at a = 1, steeper midtones above.
fn s_curve(x: f32, a: f32) -> f32 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let xa = x.powf(a);
    let one_minus_xa = (1.0 - x).powf(a);
    xa / (xa + one_minus_xa)
}

fn feather(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn lut_lerp(lut: &[f32; TONE_LUT_SIZE], y: f32) -> f32 {
    let idx_f = y * (TONE_LUT_SIZE - 1) as f32;
    let i0 = (idx_f as usize).min(TONE_LUT_SIZE - 2);
    let frac = idx_f - i0 as f32;
    lut[i0] * (1.0 - frac) + lut[i0 + 1] * frac
}

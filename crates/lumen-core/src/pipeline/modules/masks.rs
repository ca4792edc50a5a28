//! Local adjustments weighted by linear-gradient and radial masks.
//!
//! Every active mask is evaluated per pixel in stack order (all linear
//! masks, then all radial masks). Each mask adjusts the running color and
//! the result is blended back by the mask weight, so overlapping masks
//! compose.

use rayon::prelude::*;

use crate::color::{linear_to_srgb, luma, smoothstep, srgb_to_linear, unit_to_byte};
use crate::image_buf::ImageBuf;
use crate::snapshot::{LinearMask, MaskAdjustments, MaskStack, RadialMask};

/// Weight of a linear gradient at normalized position `(px, py)`.
/// 1 on the start side, 0 past the end, with the transition centered
/// between the two points and `feather` wide (in gradient units).
pub fn linear_weight(mask: &LinearMask, px: f32, py: f32) -> f32 {
    let (dx, dy) = (mask.end.x - mask.start.x, mask.end.y - mask.start.y);
    let len2 = dx * dx + dy * dy;
    if len2 < 1e-8 {
        return 0.0;
    }
    let t = ((px - mask.start.x) * dx + (py - mask.start.y) * dy) / len2;
    let f = mask.feather.clamp(0.0, 1.0);
    1.0 - smoothstep(0.5 - f / 2.0, 0.5 + f / 2.0, t)
}

/// Weight of an elliptical mask at normalized position `(px, py)` in a
/// `width` x `height` image. Distances are measured in pixels so the
/// ellipse rotates without shearing on non-square frames.
pub fn radial_weight(mask: &RadialMask, px: f32, py: f32, width: f32, height: f32) -> f32 {
    let rx = mask.radius_x * width;
    let ry = mask.radius_y * height;
    if rx <= 0.0 || ry <= 0.0 {
        return if mask.invert { 1.0 } else { 0.0 };
    }
    let dx = (px - mask.center.x) * width;
    let dy = (py - mask.center.y) * height;
    let (sin, cos) = mask.rotation.to_radians().sin_cos();
    let lx = (dx * cos + dy * sin) / rx;
    let ly = (-dx * sin + dy * cos) / ry;
    let d = (lx * lx + ly * ly).sqrt();

    let f = mask.feather.clamp(0.0, 1.0);
    let w = 1.0 - smoothstep(1.0 - f, 1.0, d);
    if mask.invert { 1.0 - w } else { w }
}

/// Apply one mask's adjustments to a perceptual sRGB color.
pub fn adjust_color(rgb: [f32; 3], adj: &MaskAdjustments) -> [f32; 3] {
    let t = adj.temperature / 100.0;
    let tint = adj.tint / 100.0;
    let exposure = 2.0_f32.powf(adj.exposure);
    let gains = [
        (1.0 + 0.3 * t) * exposure,
        (1.0 - 0.3 * tint) * exposure,
        (1.0 - 0.3 * t) * exposure,
    ];
    let mut v = [0.0_f32; 3];
    for i in 0..3 {
        v[i] = linear_to_srgb((srgb_to_linear(rgb[i]) * gains[i]).clamp(0.0, 1.0));
    }

    let l = luma(v[0], v[1], v[2]);
    let lift = adj.highlights / 100.0 * 0.25 * smoothstep(0.5, 1.0, l)
        + adj.shadows / 100.0 * 0.25 * (1.0 - smoothstep(0.0, 0.5, l));
    let contrast = 1.0 + adj.contrast / 100.0;
    for c in &mut v {
        *c = (*c + lift - 0.5) * contrast + 0.5;
    }

    let l = luma(v[0], v[1], v[2]);
    let sat = 1.0 + adj.saturation / 100.0;
    v.map(|c| (l + (c - l) * sat).clamp(0.0, 1.0))
}

/// Run the whole stack over one perceptual sRGB color at normalized
/// position `(px, py)`.
pub fn shade(
    stack: &MaskStack,
    rgb: [f32; 3],
    px: f32,
    py: f32,
    width: f32,
    height: f32,
) -> [f32; 3] {
    let weighted = stack
        .active_linear()
        .map(|m| (linear_weight(m, px, py), &m.adjustments))
        .chain(
            stack
                .active_radial()
                .map(|m| (radial_weight(m, px, py, width, height), &m.adjustments)),
        );

    let mut color = rgb;
    for (w, adj) in weighted {
        if w <= 0.0 {
            continue;
        }
        let adjusted = adjust_color(color, adj);
        for i in 0..3 {
            color[i] += (adjusted[i] - color[i]) * w;
        }
    }
    color
}

pub fn apply_masks(input: &ImageBuf, stack: &MaskStack) -> ImageBuf {
    if stack.is_identity() || input.is_empty() {
        return input.clone();
    }
    let (w, h) = (input.width as f32, input.height as f32);
    let c = input.channels();
    let mut out = input.clone();
    let stride = out.row_stride();

    out.data
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(y, row)| {
            let py = (y as f32 + 0.5) / h;
            for (x, px) in row.chunks_exact_mut(c).enumerate() {
                let rgb = [
                    px[0] as f32 / 255.0,
                    px[1] as f32 / 255.0,
                    px[2] as f32 / 255.0,
                ];
                let shaded = shade(stack, rgb, (x as f32 + 0.5) / w, py, w, h);
                for (dst, v) in px.iter_mut().zip(shaded) {
                    *dst = unit_to_byte(v);
                }
            }
        });
    out
}

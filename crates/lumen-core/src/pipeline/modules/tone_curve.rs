use rayon::prelude::*;

use crate::color::unit_to_byte;
use crate::image_buf::ImageBuf;
use crate::snapshot::{CurvePoint, ToneCurve};

/// Sample the curve into a byte LUT using monotone cubic (Fritsch–Carlson)
/// interpolation, so the curve never overshoots between control points.
pub fn curve_lut(curve: &ToneCurve) -> [u8; 256] {
    let pts = curve.normalized();
    let tangents = monotone_tangents(&pts);

    let mut lut = [0u8; 256];
    let mut seg = 0;
    for (i, entry) in lut.iter_mut().enumerate() {
        let x = i as f32 / 255.0;
        while seg + 2 < pts.len() && x > pts[seg + 1].x {
            seg += 1;
        }
        *entry = unit_to_byte(hermite(&pts, &tangents, seg, x));
    }
    lut
}

fn monotone_tangents(pts: &[CurvePoint]) -> Vec<f32> {
    let n = pts.len();
    let secants: Vec<f32> = pts
        .windows(2)
        .map(|w| {
            let dx = w[1].x - w[0].x;
            if dx > 0.0 { (w[1].y - w[0].y) / dx } else { 0.0 }
        })
        .collect();

    let mut m = vec![0.0_f32; n];
    m[0] = secants[0];
    m[n - 1] = secants[n - 2];
    for i in 1..n - 1 {
        let (a, b) = (secants[i - 1], secants[i]);
        m[i] = if a * b <= 0.0 { 0.0 } else { (a + b) / 2.0 };
    }

    for (i, &d) in secants.iter().enumerate() {
        if d == 0.0 {
            m[i] = 0.0;
            m[i + 1] = 0.0;
            continue;
        }
        let alpha = m[i] / d;
        let beta = m[i + 1] / d;
        let s = alpha * alpha + beta * beta;
        if s > 9.0 {
            let tau = 3.0 / s.sqrt();
            m[i] = tau * alpha * d;
            m[i + 1] = tau * beta * d;
        }
    }
    m
}

fn hermite(pts: &[CurvePoint], m: &[f32], seg: usize, x: f32) -> f32 {
    let (p0, p1) = (pts[seg], pts[seg + 1]);
    let h = p1.x - p0.x;
    if h <= 0.0 {
        return p0.y;
    }
    let t = ((x - p0.x) / h).clamp(0.0, 1.0);
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    h00 * p0.y + h10 * h * m[seg] + h01 * p1.y + h11 * h * m[seg + 1]
}

/// Map R, G and B through the curve LUT. Alpha is passed through.
pub fn apply_tone_curve(input: &ImageBuf, curve: &ToneCurve) -> ImageBuf {
    if curve.is_identity() {
        return input.clone();
    }
    let lut = curve_lut(curve);
    let c = input.channels();
    let mut out = input.clone();
    out.data.par_chunks_mut(c).for_each(|px| {
        for v in &mut px[..3] {
            *v = lut[*v as usize];
        }
    });
    out
}

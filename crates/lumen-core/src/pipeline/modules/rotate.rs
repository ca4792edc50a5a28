use rayon::prelude::*;

use crate::color::unit_to_byte;
use crate::image_buf::ImageBuf;
use crate::snapshot::Rotation;

/// Rotate clockwise by `rotation.total_degrees()` into the bounding box of
/// the rotated frame. Uncovered corners are black (transparent for RGBA).
pub fn rotate(input: &ImageBuf, rotation: &Rotation) -> ImageBuf {
    if rotation.is_identity() || input.is_empty() {
        return input.clone();
    }

    let (out_w, out_h) = rotation.output_dims(input.width, input.height);
    let theta = rotation.total_degrees().to_radians();
    let (sin, cos) = theta.sin_cos();
    let c = input.channels();
    let mut out = ImageBuf::new(out_w, out_h, input.layout);
    let stride = out.row_stride();

    let (in_w, in_h) = (input.width as f32, input.height as f32);
    let (half_ow, half_oh) = (out_w as f32 / 2.0, out_h as f32 / 2.0);

    out.data
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(y, row)| {
            let dy = y as f32 + 0.5 - half_oh;
            for (x, px) in row.chunks_exact_mut(c).enumerate() {
                let dx = x as f32 + 0.5 - half_ow;
                // Inverse mapping: rotate the output offset back by -theta.
                let u = dx * cos + dy * sin + in_w / 2.0 - 0.5;
                let v = -dx * sin + dy * cos + in_h / 2.0 - 0.5;
                sample_bilinear(input, u, v, px);
            }
        });
    out
}

/// Bilinear sample at pixel-center coordinates `(u, v)`. Points more than
/// half a pixel outside the frame are background.
fn sample_bilinear(input: &ImageBuf, u: f32, v: f32, dst: &mut [u8]) {
    let max_x = input.width as f32 - 1.0;
    let max_y = input.height as f32 - 1.0;
    if u < -0.5 || v < -0.5 || u > max_x + 0.5 || v > max_y + 0.5 {
        dst.fill(0);
        return;
    }

    let u = u.clamp(0.0, max_x);
    let v = v.clamp(0.0, max_y);
    let x0 = u.floor() as u32;
    let y0 = v.floor() as u32;
    let x1 = (x0 + 1).min(input.width - 1);
    let y1 = (y0 + 1).min(input.height - 1);
    let fx = u - x0 as f32;
    let fy = v - y0 as f32;

    let p00 = input.pixel(x0, y0);
    let p10 = input.pixel(x1, y0);
    let p01 = input.pixel(x0, y1);
    let p11 = input.pixel(x1, y1);
    for (i, d) in dst.iter_mut().enumerate() {
        let top = p00[i] as f32 * (1.0 - fx) + p10[i] as f32 * fx;
        let bottom = p01[i] as f32 * (1.0 - fx) + p11[i] as f32 * fx;
        *d = unit_to_byte((top * (1.0 - fy) + bottom * fy) / 255.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_buf::PixelLayout;

    fn numbered(w: u32, h: u32) -> ImageBuf {
        let data = (0..w * h).flat_map(|i| [i as u8 * 10, 0, 0]).collect();
        ImageBuf::from_data(w, h, PixelLayout::Rgb8, data).unwrap()
    }

    fn rot(deg: f32) -> Rotation {
        Rotation {
            angle: deg,
            straighten: 0.0,
        }
    }

    #[test]
    fn identity_is_noop() {
        let img = numbered(3, 2);
        assert_eq!(rotate(&img, &Rotation::default()), img);
    }

    #[test]
    fn quarter_turn_is_exact() {
        // 3x2:   0 1 2      rotated 90 cw (2x3):  3 0
        //        3 4 5                           4 1
        //                                        5 2
        let img = numbered(3, 2);
        let out = rotate(&img, &rot(90.0));
        assert_eq!((out.width, out.height), (2, 3));
        let reds: Vec<u8> = out.data.chunks_exact(3).map(|p| p[0] / 10).collect();
        assert_eq!(reds, vec![3, 0, 4, 1, 5, 2]);
    }

    #[test]
    fn half_turn_reverses_pixels() {
        let img = numbered(3, 2);
        let out = rotate(&img, &rot(180.0));
        let reds: Vec<u8> = out.data.chunks_exact(3).map(|p| p[0] / 10).collect();
        assert_eq!(reds, vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn straighten_expands_and_fills_corners() {
        let img = ImageBuf::from_data(20, 10, PixelLayout::Rgba8, [200, 200, 200, 255].repeat(200))
            .unwrap();
        let out = rotate(
            &img,
            &Rotation {
                angle: 0.0,
                straighten: 15.0,
            },
        );
        assert!(out.width > 20 && out.height > 10);
        assert_eq!(out.pixel(0, 0), [0, 0, 0, 0]);
        let center = out.pixel(out.width / 2, out.height / 2);
        assert_eq!(center, [200, 200, 200, 255]);
    }
}

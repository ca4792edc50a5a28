//! Immutable edit parameters captured at the start of every render.
//!
//! The live editor state is a mutable [`EditSnapshot`] held by the edit
//! store; renders clone it once and never look back at the live value.

use serde::{Deserialize, Serialize};

/// Slider values closer to zero than this are treated as untouched.
pub const PARAM_EPS: f32 = 1e-4;

fn is_zero(v: f32) -> bool {
    v.abs() < PARAM_EPS
}

/// The ten global sliders of the basic panel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Adjustments {
    /// Exposure compensation in EV stops (-5..5).
    pub exposure: f32,
    pub contrast: f32,
    pub highlights: f32,
    pub shadows: f32,
    pub whites: f32,
    pub blacks: f32,
    /// Blue (-) to amber (+), -100..100.
    pub temperature: f32,
    /// Green (-) to magenta (+), -100..100.
    pub tint: f32,
    pub vibrance: f32,
    pub saturation: f32,
}

impl Adjustments {
    pub fn is_identity(&self) -> bool {
        [
            self.exposure,
            self.contrast,
            self.highlights,
            self.shadows,
            self.whites,
            self.blacks,
            self.temperature,
            self.tint,
            self.vibrance,
            self.saturation,
        ]
        .into_iter()
        .all(is_zero)
    }

    /// True when any slider that feeds the luminance tone LUT is set.
    pub fn has_tone(&self) -> bool {
        !(is_zero(self.contrast)
            && is_zero(self.highlights)
            && is_zero(self.shadows)
            && is_zero(self.whites)
            && is_zero(self.blacks))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub x: f32,
    pub y: f32,
}

impl CurvePoint {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Point curve applied to R, G and B. The first and last points are the
/// anchors at x = 0 and x = 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToneCurve {
    pub points: Vec<CurvePoint>,
}

impl Default for ToneCurve {
    fn default() -> Self {
        Self {
            points: vec![CurvePoint::new(0.0, 0.0), CurvePoint::new(1.0, 1.0)],
        }
    }
}

impl ToneCurve {
    pub fn is_identity(&self) -> bool {
        self.points.iter().all(|p| (p.x - p.y).abs() < PARAM_EPS)
    }

    /// Points clamped to the unit square, sorted by x, with the anchors
    /// forced to x = 0 and x = 1.
    pub fn normalized(&self) -> Vec<CurvePoint> {
        let mut pts: Vec<CurvePoint> = self
            .points
            .iter()
            .map(|p| CurvePoint::new(p.x.clamp(0.0, 1.0), p.y.clamp(0.0, 1.0)))
            .collect();
        pts.sort_by(|a, b| a.x.total_cmp(&b.x));
        pts.dedup_by(|a, b| (a.x - b.x).abs() < PARAM_EPS);

        match pts.first_mut() {
            Some(first) => first.x = 0.0,
            None => return ToneCurve::default().points,
        }
        if pts.len() == 1 {
            pts.push(CurvePoint::new(1.0, 1.0));
        }
        if let Some(last) = pts.last_mut() {
            last.x = 1.0;
        }
        pts
    }
}

/// Normalized crop rectangle in the rotated frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl CropRect {
    pub const FULL: CropRect = CropRect {
        left: 0.0,
        top: 0.0,
        width: 1.0,
        height: 1.0,
    };

    pub fn is_full_frame(&self) -> bool {
        is_zero(self.left)
            && is_zero(self.top)
            && (self.width - 1.0).abs() < PARAM_EPS
            && (self.height - 1.0).abs() < PARAM_EPS
    }

    /// Pixel rectangle `(x, y, w, h)` inside a `width` x `height` frame.
    /// Always at least 1x1 and always inside the frame.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let x = ((self.left.max(0.0) * width as f32) as u32).min(width.saturating_sub(1));
        let y = ((self.top.max(0.0) * height as f32) as u32).min(height.saturating_sub(1));
        let w = ((self.width.max(0.0) * width as f32).round() as u32)
            .min(width - x)
            .max(1);
        let h = ((self.height.max(0.0) * height as f32).round() as u32)
            .min(height - y)
            .max(1);
        (x, y, w, h)
    }
}

/// Base rotation (multiples of 90 from the rotate buttons) plus the fine
/// straighten angle. Both in degrees, summed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rotation {
    pub angle: f32,
    pub straighten: f32,
}

impl Rotation {
    /// Total rotation in degrees, normalized to [0, 360).
    pub fn total_degrees(&self) -> f32 {
        (self.angle + self.straighten).rem_euclid(360.0)
    }

    pub fn is_identity(&self) -> bool {
        let t = self.total_degrees();
        t < PARAM_EPS || (360.0 - t) < PARAM_EPS
    }

    /// Bounding box of a `width` x `height` frame rotated by this amount.
    pub fn output_dims(&self, width: u32, height: u32) -> (u32, u32) {
        if self.is_identity() {
            return (width, height);
        }
        let theta = self.total_degrees().to_radians();
        let (s, c) = (theta.sin().abs(), theta.cos().abs());
        let w = width as f32 * c + height as f32 * s;
        let h = width as f32 * s + height as f32 * c;
        ((w.round() as u32).max(1), (h.round() as u32).max(1))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MaskPoint {
    pub x: f32,
    pub y: f32,
}

/// Local adjustment subset carried by every mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskAdjustments {
    pub exposure: f32,
    pub contrast: f32,
    pub highlights: f32,
    pub shadows: f32,
    pub temperature: f32,
    pub tint: f32,
    pub saturation: f32,
}

impl MaskAdjustments {
    pub fn is_identity(&self) -> bool {
        [
            self.exposure,
            self.contrast,
            self.highlights,
            self.shadows,
            self.temperature,
            self.tint,
            self.saturation,
        ]
        .into_iter()
        .all(is_zero)
    }
}

/// Gradient that is fully applied at `start` and fades out by `end`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearMask {
    pub id: String,
    pub enabled: bool,
    pub start: MaskPoint,
    pub end: MaskPoint,
    /// Width of the transition, 0 (hard edge at the midpoint) to 1.
    pub feather: f32,
    pub adjustments: MaskAdjustments,
}

/// Elliptical mask, fully applied inside and fading out at the rim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RadialMask {
    pub id: String,
    pub enabled: bool,
    pub center: MaskPoint,
    /// Horizontal radius as a fraction of the image width.
    pub radius_x: f32,
    /// Vertical radius as a fraction of the image height.
    pub radius_y: f32,
    /// Ellipse rotation in degrees.
    #[serde(default)]
    pub rotation: f32,
    /// Fraction of the radius over which the mask fades, 0..1.
    pub feather: f32,
    #[serde(default)]
    pub invert: bool,
    pub adjustments: MaskAdjustments,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskStack {
    pub linear: Vec<LinearMask>,
    pub radial: Vec<RadialMask>,
}

impl MaskStack {
    pub fn active_linear(&self) -> impl Iterator<Item = &LinearMask> {
        self.linear
            .iter()
            .filter(|m| m.enabled && !m.adjustments.is_identity())
    }

    pub fn active_radial(&self) -> impl Iterator<Item = &RadialMask> {
        self.radial
            .iter()
            .filter(|m| m.enabled && !m.adjustments.is_identity())
    }

    pub fn active_count(&self) -> usize {
        self.active_linear().count() + self.active_radial().count()
    }

    pub fn is_identity(&self) -> bool {
        self.active_count() == 0
    }
}

/// Everything one render needs to know about the edit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditSnapshot {
    pub adjustments: Adjustments,
    pub curve: ToneCurve,
    pub crop: Option<CropRect>,
    pub rotation: Rotation,
    pub masks: MaskStack,
}

impl EditSnapshot {
    /// The crop to apply, if any. A full-frame rectangle is no crop.
    pub fn effective_crop(&self) -> Option<CropRect> {
        self.crop.filter(|c| !c.is_full_frame())
    }

    pub fn is_identity(&self) -> bool {
        self.rotation.is_identity()
            && self.effective_crop().is_none()
            && self.adjustments.is_identity()
            && self.curve.is_identity()
            && self.masks.is_identity()
    }
}

pub mod modules;

use std::fmt;

use tracing::debug;

use crate::backend::ComputeBackend;
use crate::error::RenderError;
use crate::image_buf::ImageBuf;
use crate::snapshot::{Adjustments, CropRect, EditSnapshot, MaskStack, Rotation, ToneCurve};

/// Processing stages, in the only order they are ever applied.
///
/// ```text
/// Source -> Rotate -> Crop -> Adjust -> Tone Curve -> Masks -> Display
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Rotate,
    Crop,
    Adjust,
    ToneCurve,
    Masks,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Rotate => "rotate",
            Self::Crop => "crop",
            Self::Adjust => "adjust",
            Self::ToneCurve => "tone_curve",
            Self::Masks => "masks",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One stage together with the parameters it runs with.
#[derive(Clone, Debug, PartialEq)]
pub enum StageOp {
    Rotate(Rotation),
    Crop(CropRect),
    Adjust(Adjustments),
    ToneCurve(ToneCurve),
    Masks(MaskStack),
}

impl StageOp {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Rotate(_) => Stage::Rotate,
            Self::Crop(_) => Stage::Crop,
            Self::Adjust(_) => Stage::Adjust,
            Self::ToneCurve(_) => Stage::ToneCurve,
            Self::Masks(_) => Stage::Masks,
        }
    }

    /// Dimensions this stage produces from a `width` x `height` input.
    pub fn output_dims(&self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Self::Rotate(r) => r.output_dims(width, height),
            Self::Crop(c) => {
                let (_, _, w, h) = c.to_pixels(width, height);
                (w, h)
            }
            _ => (width, height),
        }
    }
}

/// The non-identity stages of `snapshot`, in pipeline order.
pub fn stages_for(snapshot: &EditSnapshot) -> Vec<StageOp> {
    let mut ops = Vec::new();
    if !snapshot.rotation.is_identity() {
        ops.push(StageOp::Rotate(snapshot.rotation));
    }
    if let Some(crop) = snapshot.effective_crop() {
        ops.push(StageOp::Crop(crop));
    }
    if !snapshot.adjustments.is_identity() {
        ops.push(StageOp::Adjust(snapshot.adjustments));
    }
    if !snapshot.curve.is_identity() {
        ops.push(StageOp::ToneCurve(snapshot.curve.clone()));
    }
    if !snapshot.masks.is_identity() {
        ops.push(StageOp::Masks(snapshot.masks.clone()));
    }
    ops
}

/// Run `ops` one at a time on `backend`, each stage consuming the previous
/// stage's buffer.
pub fn run_sequential(
    backend: &dyn ComputeBackend,
    input: &ImageBuf,
    ops: &[StageOp],
) -> Result<ImageBuf, RenderError> {
    let mut current: Option<ImageBuf> = None;
    for op in ops {
        let stage = op.stage();
        debug!(%stage, backend = backend.name(), "processing");
        let src = current.as_ref().unwrap_or(input);
        let next = backend
            .run_stage(src, op)
            .map_err(|source| RenderError::StageFailed {
                stage: stage.name(),
                source,
            })?;
        current = Some(next);
    }
    Ok(current.unwrap_or_else(|| input.clone()))
}

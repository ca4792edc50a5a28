use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analysis::Analysis;
use crate::canvas::CanvasTexture;
use crate::error::BackendError;
use crate::image_buf::ImageBuf;
use crate::pipeline::StageOp;
use crate::snapshot::{Adjustments, CropRect, MaskStack, Rotation, ToneCurve};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Gpu,
    Cpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeFormat {
    Jpeg { quality: u8 },
    Png,
}

/// The primitive operations of the preview pipeline. Every operation takes
/// a packed buffer and returns a new one; inputs are never modified.
pub trait ComputeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str;

    fn decode(&self, bytes: &[u8]) -> Result<ImageBuf, BackendError>;

    fn rotate(&self, input: &ImageBuf, rotation: &Rotation) -> Result<ImageBuf, BackendError>;

    fn crop(&self, input: &ImageBuf, rect: &CropRect) -> Result<ImageBuf, BackendError>;

    fn adjust(&self, input: &ImageBuf, adjustments: &Adjustments)
    -> Result<ImageBuf, BackendError>;

    fn apply_tone_curve(&self, input: &ImageBuf, curve: &ToneCurve)
    -> Result<ImageBuf, BackendError>;

    fn apply_masks(&self, input: &ImageBuf, masks: &MaskStack) -> Result<ImageBuf, BackendError>;

    fn encode(&self, input: &ImageBuf, format: EncodeFormat) -> Result<Vec<u8>, BackendError>;

    /// Histogram and clipping map of `input`.
    fn compute_histogram(&self, input: &ImageBuf) -> Result<Analysis, BackendError>;

    fn run_stage(&self, input: &ImageBuf, op: &StageOp) -> Result<ImageBuf, BackendError> {
        match op {
            StageOp::Rotate(r) => self.rotate(input, r),
            StageOp::Crop(c) => self.crop(input, c),
            StageOp::Adjust(a) => self.adjust(input, a),
            StageOp::ToneCurve(c) => self.apply_tone_curve(input, c),
            StageOp::Masks(m) => self.apply_masks(input, m),
        }
    }

    /// Run several stages as one unit of work. Backends that can fuse
    /// stages (one GPU submission) override this.
    fn run_batch(&self, input: &ImageBuf, ops: &[StageOp]) -> Result<ImageBuf, BackendError> {
        let mut current: Option<ImageBuf> = None;
        for op in ops {
            current = Some(self.run_stage(current.as_ref().unwrap_or(input), op)?);
        }
        Ok(current.unwrap_or_else(|| input.clone()))
    }

    /// Run `ops` and write the result straight into a canvas texture.
    /// Pixels are read back only when `readback` is set.
    fn run_batch_into(
        &self,
        _input: &ImageBuf,
        _ops: &[StageOp],
        _target: &mut dyn CanvasTexture,
        _readback: bool,
    ) -> Result<Option<ImageBuf>, BackendError> {
        Err(BackendError::Unsupported {
            op: "run_batch_into",
        })
    }
}

/// Lazily creates the GPU backend. Returns `Unavailable` when the platform
/// has no usable adapter.
pub trait BackendProvider: Send + Sync {
    fn init(&self) -> Result<Arc<dyn ComputeBackend>, BackendError>;
}

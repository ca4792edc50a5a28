use crate::analysis::{self, Analysis};
use crate::backend::{BackendKind, ComputeBackend, EncodeFormat};
use crate::codec;
use crate::error::BackendError;
use crate::image_buf::ImageBuf;
use crate::pipeline::modules;
use crate::snapshot::{Adjustments, CropRect, MaskStack, Rotation, ToneCurve};

/// Reference implementation of every primitive. Row loops run on the
/// rayon pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

fn check(input: &ImageBuf) -> Result<(), BackendError> {
    let expected = input.pixel_count() * input.channels();
    if input.data.len() != expected {
        return Err(BackendError::InvalidInput(format!(
            "buffer holds {} bytes, {}x{} needs {expected}",
            input.data.len(),
            input.width,
            input.height
        )));
    }
    Ok(())
}

impl ComputeBackend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn name(&self) -> &str {
        "cpu"
    }

    fn decode(&self, bytes: &[u8]) -> Result<ImageBuf, BackendError> {
        codec::decode(bytes).map_err(|e| BackendError::failed("decode", e))
    }

    fn rotate(&self, input: &ImageBuf, rotation: &Rotation) -> Result<ImageBuf, BackendError> {
        check(input)?;
        Ok(modules::rotate(input, rotation))
    }

    fn crop(&self, input: &ImageBuf, rect: &CropRect) -> Result<ImageBuf, BackendError> {
        check(input)?;
        Ok(modules::crop(input, rect))
    }

    fn adjust(
        &self,
        input: &ImageBuf,
        adjustments: &Adjustments,
    ) -> Result<ImageBuf, BackendError> {
        check(input)?;
        Ok(modules::adjust(input, adjustments))
    }

    fn apply_tone_curve(
        &self,
        input: &ImageBuf,
        curve: &ToneCurve,
    ) -> Result<ImageBuf, BackendError> {
        check(input)?;
        Ok(modules::apply_tone_curve(input, curve))
    }

    fn apply_masks(&self, input: &ImageBuf, masks: &MaskStack) -> Result<ImageBuf, BackendError> {
        check(input)?;
        Ok(modules::apply_masks(input, masks))
    }

    fn encode(&self, input: &ImageBuf, format: EncodeFormat) -> Result<Vec<u8>, BackendError> {
        check(input)?;
        codec::encode(input, format).map_err(|e| BackendError::failed("encode", e))
    }

    fn compute_histogram(&self, input: &ImageBuf) -> Result<Analysis, BackendError> {
        check(input)?;
        Ok(analysis::analyze(input))
    }
}

use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use tracing::{debug, info};

use lumen_core::analysis::Analysis;
use lumen_core::backend::{BackendKind, BackendProvider, ComputeBackend, EncodeFormat};
use lumen_core::canvas::CanvasTexture;
use lumen_core::error::BackendError;
use lumen_core::image_buf::ImageBuf;
use lumen_core::pipeline::StageOp;
use lumen_core::snapshot::{Adjustments, CropRect, MaskStack, Rotation, ToneCurve};

use crate::canvas::SurfaceFrame;
use crate::context::GpuContext;
use crate::pipeline::{GpuPipeline, plan_passes};
use crate::texture::{GpuTexture, Readback, extent};

/// Compute backend running every batch as one command buffer.
pub struct GpuBackend {
    ctx: Arc<GpuContext>,
    /// Held for a whole batch so error scopes from two batches never nest.
    pipeline: Mutex<GpuPipeline>,
    max_masks: usize,
}

impl GpuBackend {
    pub fn new(ctx: Arc<GpuContext>, max_masks: usize) -> anyhow::Result<Self> {
        let pipeline = ctx
            .scoped(|| Ok(GpuPipeline::new(&ctx)))
            .context("compile compute kernels")?;
        Ok(Self {
            ctx,
            pipeline: Mutex::new(pipeline),
            max_masks,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// Upload `input`, record every pass, optionally copy the result into
    /// `target` and read it back, then submit once.
    fn execute(
        &self,
        op: &'static str,
        input: &ImageBuf,
        ops: &[StageOp],
        target: Option<&wgpu::Texture>,
        readback: bool,
    ) -> Result<Option<ImageBuf>, BackendError> {
        let passes = plan_passes(ops, self.max_masks)?;

        let limit = self.ctx.max_texture_dimension();
        let mut dims = (input.width, input.height);
        for stage in ops {
            dims = stage.output_dims(dims.0, dims.1);
            if dims.0 > limit || dims.1 > limit {
                return Err(BackendError::InvalidInput(format!(
                    "{}x{} exceeds the GPU texture limit of {limit}",
                    dims.0, dims.1
                )));
            }
        }
        if input.width > limit || input.height > limit || input.is_empty() {
            return Err(BackendError::InvalidInput(format!(
                "cannot upload a {}x{} image",
                input.width, input.height
            )));
        }

        let pipeline = self
            .pipeline
            .lock()
            .map_err(|_| BackendError::failed(op, anyhow!("GPU pipeline lock poisoned")))?;

        let result = self.ctx.scoped(|| {
            let device = &self.ctx.device;
            let mut current = GpuTexture::from_image_buf(device, &self.ctx.queue, input, "source");
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("batch_encoder"),
            });

            // Intermediates stay alive until the submission is recorded.
            let mut retired = Vec::with_capacity(passes.len());
            for pass in &passes {
                let next = pipeline.encode_pass(&self.ctx, &mut encoder, &current, pass)?;
                retired.push(std::mem::replace(&mut current, next));
            }

            if let Some(target) = target {
                let width = current.width.min(target.width());
                let height = current.height.min(target.height());
                encoder.copy_texture_to_texture(
                    current.texture.as_image_copy(),
                    target.as_image_copy(),
                    extent(width, height),
                );
            }

            let pending = readback.then(|| Readback::record(device, &mut encoder, &current));
            self.ctx.queue.submit(std::iter::once(encoder.finish()));
            debug!(passes = passes.len(), direct = target.is_some(), "GPU batch submitted");
            drop(retired);

            pending
                .map(|r| r.finish(device, input.layout))
                .transpose()
                .context("GPU readback failed")
        });
        result.map_err(|e| BackendError::failed(op, e))
    }

    fn read_batch(
        &self,
        op: &'static str,
        input: &ImageBuf,
        ops: &[StageOp],
    ) -> Result<ImageBuf, BackendError> {
        self.execute(op, input, ops, None, true)?
            .ok_or_else(|| BackendError::failed(op, anyhow!("readback produced no image")))
    }
}

impl ComputeBackend for GpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    fn name(&self) -> &str {
        "gpu"
    }

    fn decode(&self, _bytes: &[u8]) -> Result<ImageBuf, BackendError> {
        Err(BackendError::Unsupported { op: "decode" })
    }

    fn rotate(&self, input: &ImageBuf, rotation: &Rotation) -> Result<ImageBuf, BackendError> {
        self.read_batch("rotate", input, &[StageOp::Rotate(*rotation)])
    }

    fn crop(&self, _input: &ImageBuf, _rect: &CropRect) -> Result<ImageBuf, BackendError> {
        Err(BackendError::Unsupported { op: "crop" })
    }

    fn adjust(
        &self,
        input: &ImageBuf,
        adjustments: &Adjustments,
    ) -> Result<ImageBuf, BackendError> {
        self.read_batch("adjust", input, &[StageOp::Adjust(*adjustments)])
    }

    fn apply_tone_curve(
        &self,
        input: &ImageBuf,
        curve: &ToneCurve,
    ) -> Result<ImageBuf, BackendError> {
        self.read_batch(
            "apply_tone_curve",
            input,
            &[StageOp::ToneCurve(curve.clone())],
        )
    }

    fn apply_masks(&self, input: &ImageBuf, masks: &MaskStack) -> Result<ImageBuf, BackendError> {
        self.read_batch("apply_masks", input, &[StageOp::Masks(masks.clone())])
    }

    fn encode(&self, _input: &ImageBuf, _format: EncodeFormat) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Unsupported { op: "encode" })
    }

    fn compute_histogram(&self, input: &ImageBuf) -> Result<Analysis, BackendError> {
        if input.is_empty() {
            return Err(BackendError::InvalidInput("empty image".into()));
        }
        let pipeline = self.pipeline.lock().map_err(|_| {
            BackendError::failed("compute_histogram", anyhow!("GPU pipeline lock poisoned"))
        })?;
        self.ctx
            .scoped(|| {
                let tex =
                    GpuTexture::from_image_buf(&self.ctx.device, &self.ctx.queue, input, "analysis");
                pipeline.histogram(&self.ctx, &tex)
            })
            .map_err(|e| BackendError::failed("compute_histogram", e))
    }

    fn run_batch(&self, input: &ImageBuf, ops: &[StageOp]) -> Result<ImageBuf, BackendError> {
        self.read_batch("run_batch", input, ops)
    }

    fn run_batch_into(
        &self,
        input: &ImageBuf,
        ops: &[StageOp],
        target: &mut dyn CanvasTexture,
        readback: bool,
    ) -> Result<Option<ImageBuf>, BackendError> {
        let Some(frame) = target.as_any_mut().downcast_mut::<SurfaceFrame>() else {
            return Err(BackendError::Unsupported {
                op: "run_batch_into",
            });
        };
        self.execute("run_batch_into", input, ops, Some(frame.texture()), readback)
    }
}

/// Creates the GPU backend on first use. With no context supplied a new
/// device is requested.
pub struct GpuProvider {
    context: Option<Arc<GpuContext>>,
    max_masks: usize,
}

impl GpuProvider {
    pub fn new(max_masks: usize) -> Self {
        Self {
            context: None,
            max_masks,
        }
    }

    /// Share a device with a canvas surface created by the host.
    pub fn with_context(context: Arc<GpuContext>, max_masks: usize) -> Self {
        Self {
            context: Some(context),
            max_masks,
        }
    }
}

impl BackendProvider for GpuProvider {
    fn init(&self) -> Result<Arc<dyn ComputeBackend>, BackendError> {
        let ctx = match &self.context {
            Some(ctx) => ctx.clone(),
            None => Arc::new(
                GpuContext::new_blocking()
                    .map_err(|e| BackendError::Unavailable(format!("{e:#}")))?,
            ),
        };
        let backend = GpuBackend::new(ctx, self.max_masks)
            .map_err(|e| BackendError::Unavailable(format!("{e:#}")))?;
        info!(max_masks = self.max_masks, "GPU backend ready");
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::CpuBackend;
    use lumen_core::image_buf::PixelLayout;
    use lumen_core::snapshot::{CurvePoint, MaskAdjustments, MaskPoint, RadialMask};

    const TOLERANCE: i32 = 3;

    fn gpu() -> Option<GpuBackend> {
        let ctx = match GpuContext::new_blocking() {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("skipping GPU test: {e:#}");
                return None;
            }
        };
        GpuBackend::new(Arc::new(ctx), 16).ok()
    }

    fn gradient(width: u32, height: u32) -> ImageBuf {
        let data = (0..width * height)
            .flat_map(|i| {
                let (x, y) = (i % width, i / width);
                [
                    (x * 255 / width) as u8,
                    (y * 255 / height) as u8,
                    ((x + y) * 127 / (width + height)) as u8,
                ]
            })
            .collect();
        ImageBuf::from_data(width, height, PixelLayout::Rgb8, data).unwrap()
    }

    fn assert_close(a: &ImageBuf, b: &ImageBuf) {
        assert_eq!((a.width, a.height, a.layout), (b.width, b.height, b.layout));
        let worst = a
            .data
            .iter()
            .zip(&b.data)
            .map(|(&x, &y)| (x as i32 - y as i32).abs())
            .max()
            .unwrap_or(0);
        assert!(worst <= TOLERANCE, "max channel difference {worst}");
    }

    fn all_stage_ops() -> Vec<StageOp> {
        vec![
            StageOp::Rotate(Rotation {
                angle: 90.0,
                straighten: 0.0,
            }),
            StageOp::Adjust(Adjustments {
                exposure: 0.4,
                contrast: 20.0,
                shadows: 30.0,
                temperature: 15.0,
                vibrance: 25.0,
                ..Default::default()
            }),
            StageOp::ToneCurve(ToneCurve {
                points: vec![
                    CurvePoint::new(0.0, 0.05),
                    CurvePoint::new(0.5, 0.6),
                    CurvePoint::new(1.0, 0.95),
                ],
            }),
            StageOp::Masks(MaskStack {
                linear: vec![],
                radial: vec![RadialMask {
                    id: "r1".into(),
                    enabled: true,
                    center: MaskPoint { x: 0.4, y: 0.6 },
                    radius_x: 0.3,
                    radius_y: 0.25,
                    rotation: 20.0,
                    feather: 0.5,
                    invert: false,
                    adjustments: MaskAdjustments {
                        exposure: -0.5,
                        saturation: 30.0,
                        ..Default::default()
                    },
                }],
            }),
        ]
    }

    #[test]
    fn unified_batch_matches_cpu() {
        let Some(gpu) = gpu() else { return };
        let img = gradient(64, 40);
        let ops = all_stage_ops();
        let expected = CpuBackend.run_batch(&img, &ops).unwrap();
        let actual = gpu.run_batch(&img, &ops).unwrap();
        assert_close(&actual, &expected);
    }

    #[test]
    fn straighten_matches_cpu() {
        let Some(gpu) = gpu() else { return };
        let img = gradient(33, 21);
        let r = Rotation {
            angle: 0.0,
            straighten: 7.5,
        };
        assert_close(
            &gpu.rotate(&img, &r).unwrap(),
            &CpuBackend.rotate(&img, &r).unwrap(),
        );
    }

    #[test]
    fn histogram_matches_cpu() {
        let Some(gpu) = gpu() else { return };
        let img = gradient(50, 30);
        let a = gpu.compute_histogram(&img).unwrap();
        let b = CpuBackend.compute_histogram(&img).unwrap();
        assert_eq!(a.histogram, b.histogram);
        assert_eq!(a.clipping.bits, b.clipping.bits);
    }

    #[test]
    fn crop_and_codecs_are_unsupported() {
        let Some(gpu) = gpu() else { return };
        let img = gradient(4, 4);
        assert!(matches!(
            gpu.crop(&img, &CropRect::FULL),
            Err(BackendError::Unsupported { op: "crop" })
        ));
        assert!(matches!(
            gpu.decode(b""),
            Err(BackendError::Unsupported { op: "decode" })
        ));
        assert!(matches!(
            gpu.run_batch(&img, &[StageOp::Crop(CropRect::FULL)]),
            Err(BackendError::Unsupported { op: "crop" })
        ));
    }
}

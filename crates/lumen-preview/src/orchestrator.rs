//! Transform pipeline orchestration: plans a render from a snapshot and
//! runs it unified (one GPU batch), staged (GPU rotate, CPU crop, GPU
//! rest) or, after any GPU failure, sequentially on the CPU.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use lumen_core::canvas::CanvasTexture;
use lumen_core::pipeline::{self, StageOp};
use lumen_core::snapshot::CropRect;
use lumen_core::{BackendError, BackendKind, ComputeBackend, EditSnapshot, ImageBuf, RenderError};

use crate::generation::{Generation, StalenessGuard};
use crate::selector::BackendSelector;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Nothing to do; the source is the output.
    Identity,
    Unified,
    /// A crop splits the batch around a CPU crop.
    Staged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderPath {
    Identity,
    Unified,
    Staged,
    /// CPU fallback, one stage at a time.
    Sequential,
}

/// The non-identity stages of a snapshot and how to run them.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    ops: Vec<StageOp>,
    crop_index: Option<usize>,
}

impl Plan {
    pub fn from_snapshot(snapshot: &EditSnapshot) -> Self {
        let ops = pipeline::stages_for(snapshot);
        let crop_index = ops.iter().position(|op| matches!(op, StageOp::Crop(_)));
        Self { ops, crop_index }
    }

    pub fn ops(&self) -> &[StageOp] {
        &self.ops
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.ops.is_empty() {
            ExecutionMode::Identity
        } else if self.crop_index.is_some() {
            ExecutionMode::Staged
        } else {
            ExecutionMode::Unified
        }
    }

    /// Output size for a `width` x `height` input, known before anything
    /// runs.
    pub fn output_dims(&self, width: u32, height: u32) -> (u32, u32) {
        self.ops
            .iter()
            .fold((width, height), |(w, h), op| op.output_dims(w, h))
    }

    /// Stages before the crop, the crop, and the stages after it.
    fn split(&self) -> Option<(&[StageOp], &CropRect, &[StageOp])> {
        let i = self.crop_index?;
        let StageOp::Crop(rect) = &self.ops[i] else {
            return None;
        };
        Some((&self.ops[..i], rect, &self.ops[i + 1..]))
    }
}

/// Everything one render needs, captured when it starts.
#[derive(Clone, Debug)]
pub struct RenderRequest {
    pub snapshot: EditSnapshot,
    pub source: Arc<ImageBuf>,
    /// Linear output scale, 1.0 for full resolution.
    pub scale: f32,
    pub generation: Generation,
}

#[derive(Debug)]
pub struct RenderOutput {
    /// Output pixels. `None` when the result went straight to a canvas
    /// texture and no readback was asked for.
    pub image: Option<ImageBuf>,
    pub dims: (u32, u32),
    pub path: RenderPath,
    pub backend: BackendKind,
    /// The GPU was tried and failed; this result came from the CPU.
    pub gpu_fallback: bool,
}

/// Run one render. When `target` is set the final pass is written into
/// it; pixels come back only when `readback` is set or there is no target.
pub fn render(
    selector: &BackendSelector,
    guard: &StalenessGuard,
    request: &RenderRequest,
    mut target: Option<&mut dyn CanvasTexture>,
    readback: bool,
) -> Result<RenderOutput, RenderError> {
    let generation = request.generation;
    guard.check(generation)?;

    let started = Instant::now();
    let input: Cow<'_, ImageBuf> = if request.scale < 1.0 {
        Cow::Owned(request.source.scaled(request.scale))
    } else {
        Cow::Borrowed(request.source.as_ref())
    };
    let plan = Plan::from_snapshot(&request.snapshot);
    let dims = plan.output_dims(input.width, input.height);
    let mode = plan.mode();

    if mode == ExecutionMode::Identity {
        if let Some(t) = target.as_mut() {
            t.write_pixels(&input).map_err(RenderError::Failed)?;
        }
        return Ok(RenderOutput {
            image: Some(input.into_owned()),
            dims,
            path: RenderPath::Identity,
            backend: BackendKind::Cpu,
            gpu_fallback: false,
        });
    }

    let gpu = selector.try_gpu(|gpu| {
        run_gpu(
            gpu,
            selector.cpu().as_ref(),
            guard,
            generation,
            &plan,
            &input,
            reborrow(&mut target),
            readback,
        )
    });
    let gpu_fallback = match gpu {
        Ok(image) => {
            let path = match mode {
                ExecutionMode::Staged => RenderPath::Staged,
                _ => RenderPath::Unified,
            };
            debug!(
                ?path,
                width = dims.0,
                height = dims.1,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "GPU render done"
            );
            return Ok(RenderOutput {
                image,
                dims,
                path,
                backend: BackendKind::Gpu,
                gpu_fallback: false,
            });
        }
        Err(RenderError::StaleDiscarded) => return Err(RenderError::StaleDiscarded),
        Err(RenderError::BackendUnavailable(reason)) => {
            debug!(%reason, "rendering on CPU");
            false
        }
        Err(e) => {
            warn!(error = %e, "GPU render failed, restarting on CPU");
            true
        }
    };

    // Restart from the untouched input; nothing the GPU attempt produced
    // is reused.
    guard.check(generation)?;
    let image = pipeline::run_sequential(selector.cpu().as_ref(), &input, plan.ops())
        .map_err(|e| RenderError::Failed(e.into()))?;
    guard.check(generation)?;
    if let Some(t) = target.as_mut() {
        t.write_pixels(&image).map_err(RenderError::Failed)?;
    }
    debug!(
        width = image.width,
        height = image.height,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "CPU render done"
    );
    Ok(RenderOutput {
        image: Some(image),
        dims,
        path: RenderPath::Sequential,
        backend: BackendKind::Cpu,
        gpu_fallback,
    })
}

fn reborrow<'a>(target: &'a mut Option<&mut dyn CanvasTexture>) -> Option<&'a mut dyn CanvasTexture> {
    match target {
        Some(t) => Some(&mut **t),
        None => None,
    }
}

fn run_gpu(
    gpu: &dyn ComputeBackend,
    cpu: &dyn ComputeBackend,
    guard: &StalenessGuard,
    generation: Generation,
    plan: &Plan,
    input: &ImageBuf,
    target: Option<&mut dyn CanvasTexture>,
    readback: bool,
) -> Result<Option<ImageBuf>, RenderError> {
    let Some((pre, rect, post)) = plan.split() else {
        return finish(gpu, input, plan.ops(), target, readback);
    };

    let rotated;
    let cropped_from = if pre.is_empty() {
        input
    } else {
        rotated = gpu.run_batch(input, pre).map_err(stage_failed(pre))?;
        guard.check(generation)?;
        &rotated
    };
    let cropped = cpu
        .crop(cropped_from, rect)
        .map_err(|source| RenderError::StageFailed {
            stage: "crop",
            source,
        })?;
    guard.check(generation)?;
    finish(gpu, &cropped, post, target, readback)
}

/// The last batch of a render, into the canvas when there is one.
fn finish(
    gpu: &dyn ComputeBackend,
    input: &ImageBuf,
    ops: &[StageOp],
    target: Option<&mut dyn CanvasTexture>,
    readback: bool,
) -> Result<Option<ImageBuf>, RenderError> {
    match target {
        Some(t) if ops.is_empty() => {
            t.write_pixels(input).map_err(|e| RenderError::StageFailed {
                stage: "present",
                source: BackendError::failed("write_pixels", e),
            })?;
            Ok(readback.then(|| input.clone()))
        }
        Some(t) => gpu
            .run_batch_into(input, ops, t, readback)
            .map_err(stage_failed(ops)),
        None if ops.is_empty() => Ok(Some(input.clone())),
        None => gpu.run_batch(input, ops).map(Some).map_err(stage_failed(ops)),
    }
}

fn stage_failed(ops: &[StageOp]) -> impl FnOnce(BackendError) -> RenderError {
    let stage = match ops {
        [op] => op.stage().name(),
        _ => "batch",
    };
    move |source| RenderError::StageFailed { stage, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingGpu, FakeProvider, RecordingGpu, RecordingTexture, gradient};
    use lumen_core::pipeline::Stage;
    use lumen_core::{CpuBackend, PixelLayout};

    fn selector_with(gpu: Arc<dyn ComputeBackend>) -> BackendSelector {
        BackendSelector::new(
            Arc::new(CpuBackend::new()),
            Some(Arc::new(FakeProvider::ready(gpu))),
            3,
        )
    }

    fn request(snapshot: EditSnapshot, source: ImageBuf, guard: &StalenessGuard) -> RenderRequest {
        RenderRequest {
            snapshot,
            source: Arc::new(source),
            scale: 1.0,
            generation: guard.capture(),
        }
    }

    fn crop_snapshot() -> EditSnapshot {
        let mut snap = EditSnapshot::default();
        snap.crop = Some(CropRect {
            left: 0.1,
            top: 0.1,
            width: 0.5,
            height: 0.5,
        });
        snap.adjustments.exposure = 0.5;
        snap
    }

    #[test]
    fn crop_routes_through_staged_mode() {
        let gpu = Arc::new(RecordingGpu::new());
        let selector = selector_with(gpu.clone());
        let guard = StalenessGuard::new();
        let req = request(crop_snapshot(), gradient(40, 20), &guard);

        let out = render(&selector, &guard, &req, None, true).unwrap();
        assert_eq!(out.path, RenderPath::Staged);
        assert_eq!(out.backend, BackendKind::Gpu);
        // No rotation, so the only GPU batch is the post-crop one.
        assert_eq!(gpu.batches(), vec![vec![Stage::Adjust]]);
        assert_eq!(out.dims, (20, 10));
        let image = out.image.unwrap();
        assert_eq!((image.width, image.height), (20, 10));

        let expected =
            pipeline::run_sequential(&CpuBackend::new(), &req.source, &pipeline::stages_for(&req.snapshot))
                .unwrap();
        assert_eq!(image, expected);
    }

    #[test]
    fn rotation_before_crop_gets_its_own_batch() {
        let gpu = Arc::new(RecordingGpu::new());
        let selector = selector_with(gpu.clone());
        let guard = StalenessGuard::new();
        let mut snap = crop_snapshot();
        snap.rotation.angle = 90.0;
        let out = render(&selector, &guard, &request(snap, gradient(40, 20), &guard), None, true).unwrap();
        assert_eq!(out.path, RenderPath::Staged);
        assert_eq!(gpu.batches(), vec![vec![Stage::Rotate], vec![Stage::Adjust]]);
        assert_eq!(out.dims, (10, 20));
    }

    #[test]
    fn uncropped_edits_run_as_one_batch() {
        let gpu = Arc::new(RecordingGpu::new());
        let selector = selector_with(gpu.clone());
        let guard = StalenessGuard::new();
        let mut snap = EditSnapshot::default();
        snap.rotation.straighten = 2.0;
        snap.adjustments.contrast = 20.0;
        snap.curve.points[1].y = 0.6;

        let out = render(&selector, &guard, &request(snap, gradient(32, 24), &guard), None, true).unwrap();
        assert_eq!(out.path, RenderPath::Unified);
        assert_eq!(
            gpu.batches(),
            vec![vec![Stage::Rotate, Stage::Adjust, Stage::ToneCurve]]
        );
    }

    #[test]
    fn failing_gpu_restarts_on_cpu_with_identical_output() {
        let selector = selector_with(Arc::new(FailingGpu));
        let guard = StalenessGuard::new();
        let mut snap = crop_snapshot();
        snap.rotation.straighten = -4.0;
        let req = request(snap, gradient(30, 30), &guard);

        let out = render(&selector, &guard, &req, None, false).unwrap();
        assert_eq!(out.path, RenderPath::Sequential);
        assert!(out.gpu_fallback);
        let expected =
            pipeline::run_sequential(&CpuBackend::new(), &req.source, &pipeline::stages_for(&req.snapshot))
                .unwrap();
        assert_eq!(out.image.unwrap(), expected);
    }

    #[test]
    fn missing_gpu_is_not_counted_as_a_fallback() {
        let selector = BackendSelector::new(Arc::new(CpuBackend::new()), None, 3);
        let guard = StalenessGuard::new();
        let mut snap = EditSnapshot::default();
        snap.adjustments.saturation = 30.0;
        let out = render(&selector, &guard, &request(snap, gradient(8, 8), &guard), None, false).unwrap();
        assert_eq!(out.path, RenderPath::Sequential);
        assert!(!out.gpu_fallback);
    }

    #[test]
    fn identity_snapshot_returns_source_pixels() {
        let gpu = Arc::new(RecordingGpu::new());
        let selector = selector_with(gpu.clone());
        let guard = StalenessGuard::new();
        let source = gradient(12, 9);
        let out = render(
            &selector,
            &guard,
            &request(EditSnapshot::default(), source.clone(), &guard),
            None,
            false,
        )
        .unwrap();
        assert_eq!(out.path, RenderPath::Identity);
        assert_eq!(out.image.unwrap(), source);
        assert!(gpu.batches().is_empty());
    }

    #[test]
    fn stale_requests_do_no_work() {
        let gpu = Arc::new(RecordingGpu::new());
        let selector = selector_with(gpu.clone());
        let guard = StalenessGuard::new();
        let req = request(crop_snapshot(), gradient(8, 8), &guard);
        guard.advance();
        assert!(matches!(
            render(&selector, &guard, &req, None, true),
            Err(RenderError::StaleDiscarded)
        ));
        assert!(gpu.batches().is_empty());
    }

    #[test]
    fn draft_scale_halves_output() {
        let selector = BackendSelector::new(Arc::new(CpuBackend::new()), None, 3);
        let guard = StalenessGuard::new();
        let mut snap = EditSnapshot::default();
        snap.adjustments.exposure = -1.0;
        let mut req = request(snap, gradient(40, 30), &guard);
        req.scale = 0.5;
        let out = render(&selector, &guard, &req, None, true).unwrap();
        assert_eq!(out.dims, (20, 15));
        let image = out.image.unwrap();
        assert_eq!((image.width, image.height), (20, 15));
    }

    #[test]
    fn direct_target_skips_readback() {
        let gpu = Arc::new(RecordingGpu::new());
        let selector = selector_with(gpu.clone());
        let guard = StalenessGuard::new();
        let mut snap = EditSnapshot::default();
        snap.adjustments.exposure = 0.3;
        let req = request(snap, gradient(16, 16), &guard);

        let mut texture = RecordingTexture::detached(16, 16);
        let out = render(&selector, &guard, &req, Some(&mut texture), false).unwrap();
        assert!(out.image.is_none());
        assert_eq!(out.dims, (16, 16));
        assert_eq!(gpu.direct_batches(), 1);
        assert!(texture.pixels.is_some());
    }

    #[test]
    fn cpu_fallback_writes_into_target() {
        let selector = selector_with(Arc::new(FailingGpu));
        let guard = StalenessGuard::new();
        let mut snap = EditSnapshot::default();
        snap.adjustments.tint = 10.0;
        let req = request(snap, gradient(6, 4), &guard);

        let mut texture = RecordingTexture::detached(6, 4);
        let out = render(&selector, &guard, &req, Some(&mut texture), false).unwrap();
        assert_eq!(out.path, RenderPath::Sequential);
        assert_eq!(texture.pixels.as_ref().map(|p| p.layout), Some(PixelLayout::Rgb8));
    }
}

//! Fakes shared by the unit tests of this crate.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use lumen_core::analysis::Analysis;
use lumen_core::asset::{
    AssetId, AssetRepresentations, AssetStore, Priority, ReadError, RepresentationHandle,
    RepresentationKind,
};
use lumen_core::canvas::{CanvasBinding, CanvasTexture};
use lumen_core::pipeline::{Stage, StageOp};
use lumen_core::snapshot::{Adjustments, CropRect, MaskStack, Rotation, ToneCurve};
use lumen_core::{
    BackendError, BackendKind, BackendProvider, ComputeBackend, CpuBackend, EncodeFormat, ImageBuf,
    PixelLayout, codec,
};

pub fn gradient(width: u32, height: u32) -> ImageBuf {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[
                (x * 255 / width.max(2).saturating_sub(1)) as u8,
                (y * 255 / height.max(2).saturating_sub(1)) as u8,
                96,
            ]);
        }
    }
    ImageBuf::from_data(width, height, PixelLayout::Rgb8, data).unwrap()
}

fn locator(id: &str, kind: RepresentationKind) -> String {
    format!("{id}/{kind:?}")
}

/// Asset store backed by PNG blobs in memory. Revoked entries stay listed
/// by `get` but fail to read.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    revoked: Mutex<HashSet<String>>,
    requests: Mutex<Vec<(AssetId, RepresentationKind, Priority)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_raw(&self, id: &str, kind: RepresentationKind, bytes: Vec<u8>) {
        self.blobs.lock().unwrap().insert(locator(id, kind), bytes);
    }

    fn insert_gradient(&self, id: &str, kind: RepresentationKind, width: u32, height: u32) {
        let png = codec::encode(&gradient(width, height), EncodeFormat::Png).unwrap();
        self.insert_raw(id, kind, png);
    }

    pub fn insert_preview(&self, id: &str, width: u32, height: u32) {
        self.insert_gradient(id, RepresentationKind::Preview, width, height);
    }

    pub fn insert_thumbnail(&self, id: &str, width: u32, height: u32) {
        self.insert_gradient(id, RepresentationKind::Thumbnail, width, height);
    }

    pub fn revoke(&self, id: &str, kind: RepresentationKind) {
        self.revoked.lock().unwrap().insert(locator(id, kind));
    }

    pub fn restore(&self, id: &str, kind: RepresentationKind) {
        self.revoked.lock().unwrap().remove(&locator(id, kind));
    }

    pub fn requests(&self) -> Vec<(AssetId, RepresentationKind, Priority)> {
        self.requests.lock().unwrap().clone()
    }
}

impl AssetStore for MemoryStore {
    fn get(&self, id: &AssetId) -> Option<AssetRepresentations> {
        let blobs = self.blobs.lock().unwrap();
        let handle = |kind| {
            let locator = locator(id.as_str(), kind);
            blobs
                .contains_key(&locator)
                .then_some(RepresentationHandle { kind, locator })
        };
        let reps = AssetRepresentations {
            preview: handle(RepresentationKind::Preview),
            thumbnail: handle(RepresentationKind::Thumbnail),
        };
        (reps != AssetRepresentations::default()).then_some(reps)
    }

    fn read(&self, handle: &RepresentationHandle) -> Result<Vec<u8>, ReadError> {
        if self.revoked.lock().unwrap().contains(&handle.locator) {
            return Err(ReadError::Revoked);
        }
        self.blobs
            .lock()
            .unwrap()
            .get(&handle.locator)
            .cloned()
            .ok_or(ReadError::Revoked)
    }

    fn request_generation(&self, id: &AssetId, kind: RepresentationKind, priority: Priority) {
        self.requests.lock().unwrap().push((id.clone(), kind, priority));
    }
}

macro_rules! delegate_primitives {
    ($field:ident) => {
        fn decode(&self, bytes: &[u8]) -> Result<ImageBuf, BackendError> {
            self.$field.decode(bytes)
        }

        fn rotate(&self, input: &ImageBuf, rotation: &Rotation) -> Result<ImageBuf, BackendError> {
            self.$field.rotate(input, rotation)
        }

        fn apply_tone_curve(
            &self,
            input: &ImageBuf,
            curve: &ToneCurve,
        ) -> Result<ImageBuf, BackendError> {
            self.$field.apply_tone_curve(input, curve)
        }

        fn apply_masks(&self, input: &ImageBuf, masks: &MaskStack) -> Result<ImageBuf, BackendError> {
            self.$field.apply_masks(input, masks)
        }

        fn encode(&self, input: &ImageBuf, format: EncodeFormat) -> Result<Vec<u8>, BackendError> {
            self.$field.encode(input, format)
        }

        fn compute_histogram(&self, input: &ImageBuf) -> Result<Analysis, BackendError> {
            self.$field.compute_histogram(input)
        }
    };
}

#[derive(Default)]
struct Gate {
    entered: bool,
    released: bool,
    active: usize,
    max_active: usize,
    finished: usize,
}

/// CPU backend whose `adjust` blocks until [`GatedBackend::release`] is
/// called. Only adjusts started before the release wait.
#[derive(Default)]
pub struct GatedBackend {
    cpu: CpuBackend,
    gate: Mutex<Gate>,
    cond: Condvar,
}

impl GatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entered(&self) -> bool {
        self.gate.lock().unwrap().entered
    }

    /// Adjust calls that have returned.
    pub fn finished(&self) -> usize {
        self.gate.lock().unwrap().finished
    }

    /// Most adjust calls ever running at once.
    pub fn max_active(&self) -> usize {
        self.gate.lock().unwrap().max_active
    }

    pub fn release(&self) {
        self.gate.lock().unwrap().released = true;
        self.cond.notify_all();
    }
}

impl ComputeBackend for GatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn name(&self) -> &str {
        "gated"
    }

    delegate_primitives!(cpu);

    fn crop(&self, input: &ImageBuf, rect: &CropRect) -> Result<ImageBuf, BackendError> {
        self.cpu.crop(input, rect)
    }

    fn adjust(&self, input: &ImageBuf, adjustments: &Adjustments) -> Result<ImageBuf, BackendError> {
        let mut gate = self.gate.lock().unwrap();
        gate.entered = true;
        gate.active += 1;
        gate.max_active = gate.max_active.max(gate.active);
        while !gate.released {
            gate = self.cond.wait(gate).unwrap();
        }
        drop(gate);
        let result = self.cpu.adjust(input, adjustments);
        let mut gate = self.gate.lock().unwrap();
        gate.active -= 1;
        gate.finished += 1;
        result
    }
}

/// CPU backend whose `adjust` fails once exposure reaches `fail_from`.
pub struct ExposureLimitBackend {
    cpu: CpuBackend,
    fail_from: f32,
}

impl ExposureLimitBackend {
    pub fn new(fail_from: f32) -> Self {
        Self {
            cpu: CpuBackend::new(),
            fail_from,
        }
    }
}

impl ComputeBackend for ExposureLimitBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn name(&self) -> &str {
        "exposure-limit"
    }

    delegate_primitives!(cpu);

    fn crop(&self, input: &ImageBuf, rect: &CropRect) -> Result<ImageBuf, BackendError> {
        self.cpu.crop(input, rect)
    }

    fn adjust(&self, input: &ImageBuf, adjustments: &Adjustments) -> Result<ImageBuf, BackendError> {
        if adjustments.exposure >= self.fail_from {
            return Err(BackendError::failed("adjust", anyhow::anyhow!("out of range")));
        }
        self.cpu.adjust(input, adjustments)
    }
}

/// Stand-in GPU: computes on the CPU, refuses crops, and records every
/// batch it is handed.
#[derive(Default)]
pub struct RecordingGpu {
    cpu: CpuBackend,
    batches: Mutex<Vec<Vec<Stage>>>,
    direct: AtomicUsize,
}

impl RecordingGpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<Stage>> {
        self.batches.lock().unwrap().clone()
    }

    /// Batches written straight into a canvas texture.
    pub fn direct_batches(&self) -> usize {
        self.direct.load(Ordering::SeqCst)
    }

    fn record(&self, ops: &[StageOp]) {
        self.batches
            .lock()
            .unwrap()
            .push(ops.iter().map(StageOp::stage).collect());
    }
}

impl ComputeBackend for RecordingGpu {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    fn name(&self) -> &str {
        "recording-gpu"
    }

    delegate_primitives!(cpu);

    fn crop(&self, _input: &ImageBuf, _rect: &CropRect) -> Result<ImageBuf, BackendError> {
        Err(BackendError::Unsupported { op: "crop" })
    }

    fn adjust(&self, input: &ImageBuf, adjustments: &Adjustments) -> Result<ImageBuf, BackendError> {
        self.cpu.adjust(input, adjustments)
    }

    fn run_batch(&self, input: &ImageBuf, ops: &[StageOp]) -> Result<ImageBuf, BackendError> {
        self.record(ops);
        self.cpu.run_batch(input, ops)
    }

    fn run_batch_into(
        &self,
        input: &ImageBuf,
        ops: &[StageOp],
        target: &mut dyn CanvasTexture,
        readback: bool,
    ) -> Result<Option<ImageBuf>, BackendError> {
        let Some(texture) = target.as_any_mut().downcast_mut::<RecordingTexture>() else {
            return Err(BackendError::Unsupported {
                op: "run_batch_into",
            });
        };
        self.record(ops);
        self.direct.fetch_add(1, Ordering::SeqCst);
        let image = self.cpu.run_batch(input, ops)?;
        texture
            .write_pixels(&image)
            .map_err(|e| BackendError::failed("run_batch_into", e))?;
        Ok(readback.then_some(image))
    }
}

/// GPU whose every operation fails as if the device was lost.
pub struct FailingGpu;

fn lost(op: &'static str) -> BackendError {
    BackendError::failed(op, anyhow::anyhow!("device lost"))
}

impl ComputeBackend for FailingGpu {
    fn kind(&self) -> BackendKind {
        BackendKind::Gpu
    }

    fn name(&self) -> &str {
        "failing-gpu"
    }

    fn decode(&self, _bytes: &[u8]) -> Result<ImageBuf, BackendError> {
        Err(BackendError::Unsupported { op: "decode" })
    }

    fn rotate(&self, _input: &ImageBuf, _rotation: &Rotation) -> Result<ImageBuf, BackendError> {
        Err(lost("rotate"))
    }

    fn crop(&self, _input: &ImageBuf, _rect: &CropRect) -> Result<ImageBuf, BackendError> {
        Err(BackendError::Unsupported { op: "crop" })
    }

    fn adjust(&self, _input: &ImageBuf, _adjustments: &Adjustments) -> Result<ImageBuf, BackendError> {
        Err(lost("adjust"))
    }

    fn apply_tone_curve(&self, _input: &ImageBuf, _curve: &ToneCurve) -> Result<ImageBuf, BackendError> {
        Err(lost("apply_tone_curve"))
    }

    fn apply_masks(&self, _input: &ImageBuf, _masks: &MaskStack) -> Result<ImageBuf, BackendError> {
        Err(lost("apply_masks"))
    }

    fn encode(&self, _input: &ImageBuf, _format: EncodeFormat) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::Unsupported { op: "encode" })
    }

    fn compute_histogram(&self, _input: &ImageBuf) -> Result<Analysis, BackendError> {
        Err(lost("compute_histogram"))
    }

    fn run_batch_into(
        &self,
        _input: &ImageBuf,
        _ops: &[StageOp],
        _target: &mut dyn CanvasTexture,
        _readback: bool,
    ) -> Result<Option<ImageBuf>, BackendError> {
        Err(lost("run_batch_into"))
    }
}

pub struct FakeProvider {
    backend: Option<Arc<dyn ComputeBackend>>,
    pub inits: AtomicUsize,
}

impl FakeProvider {
    pub fn ready(backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            backend: Some(backend),
            inits: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            backend: None,
            inits: AtomicUsize::new(0),
        }
    }
}

impl BackendProvider for FakeProvider {
    fn init(&self) -> Result<Arc<dyn ComputeBackend>, BackendError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.backend
            .clone()
            .ok_or_else(|| BackendError::Unavailable("no adapter".into()))
    }
}

#[derive(Debug, Default)]
pub struct CanvasLog {
    pub configured: u32,
    pub unconfigured: u32,
    pub acquired: u32,
    pub presented: u32,
    pub resized: Vec<(u32, u32)>,
    pub last_presented: Option<ImageBuf>,
}

pub type SharedLog = Arc<Mutex<CanvasLog>>;

pub struct RecordingCanvas {
    log: SharedLog,
    dims: (u32, u32),
    configured: bool,
    pub fail_configure: bool,
}

impl RecordingCanvas {
    pub fn new() -> (Self, SharedLog) {
        let log = SharedLog::default();
        let canvas = Self {
            log: log.clone(),
            dims: (1, 1),
            configured: false,
            fail_configure: false,
        };
        (canvas, log)
    }
}

impl CanvasBinding for RecordingCanvas {
    fn configure(&mut self) -> bool {
        if self.fail_configure {
            return false;
        }
        self.configured = true;
        self.log.lock().unwrap().configured += 1;
        true
    }

    fn current_texture(&mut self) -> Option<Box<dyn CanvasTexture>> {
        if !self.configured {
            return None;
        }
        self.log.lock().unwrap().acquired += 1;
        Some(Box::new(RecordingTexture {
            size: self.dims,
            log: self.log.clone(),
            pixels: None,
        }))
    }

    fn update_dimensions(&mut self, width: u32, height: u32) {
        if self.dims != (width, height) {
            self.dims = (width, height);
            self.log.lock().unwrap().resized.push((width, height));
        }
    }

    fn unconfigure(&mut self) {
        self.configured = false;
        self.log.lock().unwrap().unconfigured += 1;
    }
}

pub struct RecordingTexture {
    size: (u32, u32),
    log: SharedLog,
    pub pixels: Option<ImageBuf>,
}

impl RecordingTexture {
    /// A texture not owned by any canvas.
    pub fn detached(width: u32, height: u32) -> Self {
        Self {
            size: (width, height),
            log: SharedLog::default(),
            pixels: None,
        }
    }
}

impl CanvasTexture for RecordingTexture {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn write_pixels(&mut self, image: &ImageBuf) -> anyhow::Result<()> {
        anyhow::ensure!(
            (image.width, image.height) == self.size,
            "{}x{} frame written into a {}x{} texture",
            image.width,
            image.height,
            self.size.0,
            self.size.1
        );
        self.pixels = Some(image.clone());
        Ok(())
    }

    fn present(self: Box<Self>) {
        let mut log = self.log.lock().unwrap();
        log.presented += 1;
        log.last_presented = self.pixels.clone();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
